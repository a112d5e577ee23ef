//! Display transform for assistant messages.
//!
//! Stored content keeps every directive tag. What the user sees has complete
//! directives replaced by their notice (or removed), and anything still
//! streaming inside an open tag hidden until the tag closes.

use crate::conversation::Message;
use crate::directives::{could_open_directive, scan, DirectiveKind};

/// Visible text of raw `content`, without substituting notices.
pub fn strip_directives(content: &str) -> String {
    render(content, |_| None)
}

/// Visible text of a message, with one-shot directives replaced by the
/// confirmation or error sentence their executor reported.
pub fn visible_text(message: &Message) -> String {
    render(&message.content, |kind| {
        message.notice_for(kind).map(|notice| notice.text.clone())
    })
}

/// Whether the message already shows anything beyond directive tags.
pub fn has_visible_output(message: &Message) -> bool {
    let d = &message.directives;
    !strip_directives(&message.content).trim().is_empty()
        || d.executable_code.is_some()
        || d.generated_images.as_ref().is_some_and(|images| !images.is_empty())
}

fn render(content: &str, notice: impl Fn(DirectiveKind) -> Option<String>) -> String {
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0;

    for directive in scan(content) {
        if directive.span.start < cursor {
            continue;
        }
        out.push_str(&content[cursor..directive.span.start]);
        if directive.complete && directive.kind != DirectiveKind::Search {
            if let Some(text) = notice(directive.kind) {
                out.push_str(&text);
            }
        }
        cursor = directive.span.end;
    }

    let tail = &content[cursor..];
    match tail.rfind('<') {
        Some(lt) if !tail[lt..].contains('>') && could_open_directive(&tail[lt + 1..]) => {
            out.push_str(&tail[..lt]);
        }
        _ => out.push_str(tail),
    }

    collapse_blank_runs(&out)
}

fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.split('\n') {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    out.trim().to_string()
}
