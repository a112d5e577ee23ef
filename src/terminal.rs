//! Line-oriented rendering of backend events.

use std::collections::HashMap;
use std::io::{self, Write};

use parley_backend::conversation::{Conversation, ConversationSummary, Message, Page, Speaker};
use parley_backend::display::visible_text;
use parley_backend::orchestrator::{DirectiveState, SideEffect};
use parley_backend::{ChatEvent, TurnStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Help,
    New,
    List,
    Load(String),
    Page(String),
    Delete(String),
    Quit,
    Say(String),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Say(line.to_string());
        };
        let mut parts = rest.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default().to_ascii_lowercase();
        let arg = parts.next().map(str::trim).unwrap_or_default();
        match name.as_str() {
            "help" | "?" => Command::Help,
            "new" => Command::New,
            "list" | "ls" => Command::List,
            "load" | "open" if !arg.is_empty() => Command::Load(arg.to_string()),
            "page" if !arg.is_empty() => Command::Page(arg.to_string()),
            "delete" | "rm" if !arg.is_empty() => Command::Delete(arg.to_string()),
            "quit" | "exit" | "q" => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

pub const HELP: &str = "\
Commands:
  /new          start a new conversation
  /list         show recent conversations
  /load <id>    reopen a conversation (restores missing search results and images)
  /page <id>    print a page created by the assistant
  /delete <id>  delete a conversation
  /quit         leave
Anything else is sent as a message. Ctrl-C cancels the reply in progress.";

#[derive(Default)]
struct Printed {
    text: String,
    code_shown: bool,
    images: usize,
}

/// Prints streamed assistant messages as deltas. Only messages announced by
/// `MessageAppended` are rendered, so late snapshots of other messages stay
/// silent.
pub struct TerminalRenderer<W: Write> {
    out: W,
    printed: HashMap<String, Printed>,
    at_line_start: bool,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            printed: HashMap::new(),
            at_line_start: true,
        }
    }

    pub fn render(&mut self, event: &ChatEvent) -> io::Result<()> {
        match event {
            ChatEvent::MessageAppended { message, .. } => {
                if message.sender == Speaker::Assistant {
                    self.break_line()?;
                    self.printed.insert(message.id.clone(), Printed::default());
                    self.show_message(message)?;
                }
            }
            ChatEvent::MessageUpdated { message, .. } => {
                if self.printed.contains_key(&message.id) {
                    self.show_message(message)?;
                }
            }
            ChatEvent::DirectiveProgress {
                effect,
                state,
                detail,
                ..
            } => {
                self.line(&progress_line(*effect, *state, detail.as_deref()))?;
            }
            ChatEvent::TurnCompleted {
                status,
                response_time_ms,
                ..
            } => {
                let seconds = *response_time_ms as f64 / 1000.0;
                let summary = match status {
                    TurnStatus::Completed => format!("({:.1}s)", seconds),
                    TurnStatus::StreamFailed => format!("(stream failed after {:.1}s)", seconds),
                    TurnStatus::Cancelled => "(cancelled)".to_string(),
                };
                self.line(&summary)?;
            }
            ChatEvent::Error(error) => self.line(&format!("error: {}", error))?,
        }
        self.out.flush()
    }

    /// Forget every tracked message, e.g. after switching conversations.
    pub fn reset(&mut self) {
        self.printed.clear();
    }

    pub fn line(&mut self, text: &str) -> io::Result<()> {
        self.break_line()?;
        writeln!(self.out, "{}", text)?;
        self.at_line_start = true;
        self.out.flush()
    }

    pub fn prompt(&mut self) -> io::Result<()> {
        self.break_line()?;
        write!(self.out, "> ")?;
        self.out.flush()
    }

    pub fn conversation_list(&mut self, conversations: &[ConversationSummary]) -> io::Result<()> {
        if conversations.is_empty() {
            return self.line("No conversations yet.");
        }
        for summary in conversations {
            let line = format!(
                "{}  {}  ({} messages, {})",
                summary.id,
                summary.title,
                summary.message_count,
                summary.updated_at.format("%Y-%m-%d %H:%M")
            );
            self.line(&line)?;
        }
        Ok(())
    }

    pub fn transcript(&mut self, conversation: &Conversation) -> io::Result<()> {
        self.line(&format!("== {} ==", conversation.title))?;
        for message in &conversation.messages {
            match message.sender {
                Speaker::User => self.line(&format!("you: {}", message.content.trim()))?,
                Speaker::Assistant => {
                    let text = visible_text(message);
                    if !text.trim().is_empty() {
                        self.line(&format!("parley: {}", text.trim()))?;
                    }
                    for line in attachment_lines(message, &mut Printed::default()) {
                        self.line(&line)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn page(&mut self, page: &Page) -> io::Result<()> {
        self.line(&format!("== {} ==", page.title))?;
        self.line(&page.body)
    }

    fn break_line(&mut self) -> io::Result<()> {
        if !self.at_line_start {
            writeln!(self.out)?;
            self.at_line_start = true;
        }
        Ok(())
    }

    fn show_message(&mut self, message: &Message) -> io::Result<()> {
        let mut printed = self.printed.remove(&message.id).unwrap_or_default();
        let visible = visible_text(message);

        if let Some(delta) = visible.strip_prefix(printed.text.as_str()) {
            if !delta.is_empty() {
                write!(self.out, "{}", delta)?;
                self.at_line_start = delta.ends_with('\n');
            }
            printed.text = visible;
        } else if !printed.text.starts_with(&visible) {
            // Earlier text was replaced (stream failure); start over.
            self.break_line()?;
            write!(self.out, "{}", visible)?;
            self.at_line_start = visible.is_empty() || visible.ends_with('\n');
            printed.text = visible;
        }

        for line in attachment_lines(message, &mut printed) {
            self.line(&line)?;
        }
        self.printed.insert(message.id.clone(), printed);
        Ok(())
    }
}

fn attachment_lines(message: &Message, printed: &mut Printed) -> Vec<String> {
    let d = &message.directives;
    let mut lines = Vec::new();

    if let Some(code) = d.executable_code.as_ref().filter(|_| !printed.code_shown) {
        printed.code_shown = true;
        lines.push(format!(
            "[code: {}, {} line(s)]",
            code.language,
            code.code.lines().count()
        ));
    }
    let images = d.generated_images.as_deref().unwrap_or_default();
    for image in images.iter().skip(printed.images) {
        if image.src.starts_with("data:") {
            lines.push(format!("[image] inline ({} bytes)", image.src.len()));
        } else {
            lines.push(format!("[image] {}", image.src));
        }
    }
    printed.images = printed.images.max(images.len());
    lines
}

fn progress_line(effect: SideEffect, state: DirectiveState, detail: Option<&str>) -> String {
    let state = match state {
        DirectiveState::NotDetected => "pending",
        DirectiveState::Running => "running",
        DirectiveState::Completed => "done",
        DirectiveState::Errored => "failed",
    };
    match detail.filter(|detail| !detail.trim().is_empty()) {
        Some(detail) => format!("[{}] {}: {}", effect, state, detail.trim()),
        None => format!("[{}] {}", effect, state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_backend::conversation::GeneratedImage;

    fn output(renderer: TerminalRenderer<Vec<u8>>) -> String {
        String::from_utf8(renderer.out).unwrap()
    }

    fn updated(message: &Message) -> ChatEvent {
        ChatEvent::MessageUpdated {
            conversation_id: message.conversation_id.clone(),
            message: message.clone(),
        }
    }

    #[test]
    fn parses_commands_and_messages() {
        assert_eq!(Command::parse("  "), Command::Empty);
        assert_eq!(Command::parse("/NEW"), Command::New);
        assert_eq!(Command::parse("/load abc-123"), Command::Load("abc-123".to_string()));
        assert_eq!(Command::parse("/load"), Command::Unknown("/load".to_string()));
        assert_eq!(Command::parse("/rm  abc"), Command::Delete("abc".to_string()));
        assert_eq!(Command::parse("hello there"), Command::Say("hello there".to_string()));
    }

    #[test]
    fn streams_deltas_and_hides_open_tags() {
        let mut renderer = TerminalRenderer::new(Vec::new());
        let mut message = Message::assistant("c");
        renderer
            .render(&ChatEvent::MessageAppended {
                conversation_id: "c".to_string(),
                message: message.clone(),
            })
            .unwrap();

        message.content = "Looking it up <SEARCHREQ".to_string();
        renderer.render(&updated(&message)).unwrap();
        message.content = "Looking it up <SEARCHREQUEST>tides</SEARCHREQUEST>".to_string();
        renderer.render(&updated(&message)).unwrap();
        message.directives.generated_images = Some(vec![GeneratedImage {
            src: "https://img/tides.png".to_string(),
            alt: None,
        }]);
        renderer.render(&updated(&message)).unwrap();
        renderer.render(&updated(&message)).unwrap();

        let text = output(renderer);
        assert!(text.starts_with("Looking it up"));
        assert!(!text.contains("SEARCH"));
        assert_eq!(text.matches("[image] https://img/tides.png").count(), 1);
    }

    #[test]
    fn ignores_messages_it_was_not_told_about() {
        let mut renderer = TerminalRenderer::new(Vec::new());
        let mut message = Message::assistant("c");
        message.content = "old answer".to_string();
        renderer.render(&updated(&message)).unwrap();
        assert_eq!(output(renderer), "");
    }

    #[test]
    fn replaced_text_is_printed_again() {
        let mut renderer = TerminalRenderer::new(Vec::new());
        let mut message = Message::assistant("c");
        message.content = "Partial".to_string();
        renderer
            .render(&ChatEvent::MessageAppended {
                conversation_id: "c".to_string(),
                message: message.clone(),
            })
            .unwrap();
        message.content = "Sorry, something went wrong".to_string();
        renderer.render(&updated(&message)).unwrap();

        assert_eq!(output(renderer), "Partial\nSorry, something went wrong");
    }

    #[test]
    fn progress_lines_name_effect_and_state() {
        assert_eq!(
            progress_line(SideEffect::Search, DirectiveState::Running, Some("Step 2: tides")),
            "[search] running: Step 2: tides"
        );
        assert_eq!(
            progress_line(SideEffect::TextFile, DirectiveState::Errored, None),
            "[text file] failed"
        );
    }
}
