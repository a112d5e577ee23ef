//! Tolerant directive tokenizer.
//!
//! The structural pass matches well-formed `<TAG attrs>body</TAG>` pairs with a
//! case-insensitive regex per kind. The fallback pass walks the buffer by hand,
//! normalizing tag names (case, `_`, `-`, inner spaces) so that tags the regex
//! misses are still recognized, and it also reports open tags whose close
//! token has not streamed in yet.

use std::ops::Range;
use std::sync::OnceLock;

use regex_lite::Regex;

use super::DirectiveKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDirective {
    pub kind: DirectiveKind,
    pub body: String,
    /// `name="..."` attribute of the open tag, if any.
    pub name: Option<String>,
    /// Both open and close tokens are present.
    pub complete: bool,
    /// Byte range of the whole directive (to end of buffer when incomplete).
    pub span: Range<usize>,
}

const CANONICAL_NAMES: &[(&str, DirectiveKind)] = &[
    ("SEARCHREQUEST", DirectiveKind::Search),
    ("WEBSEARCH", DirectiveKind::Search),
    ("SEARCH", DirectiveKind::Search),
    ("IMG", DirectiveKind::Image),
    ("PAGE", DirectiveKind::Page),
    ("TEXTFILE", DirectiveKind::TextFile),
    ("TASKCREATE", DirectiveKind::TaskCreate),
    ("FUNCTIONCALL", DirectiveKind::FunctionCall),
];

fn structural_patterns() -> &'static [(DirectiveKind, Regex)] {
    static PATTERNS: OnceLock<Vec<(DirectiveKind, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DirectiveKind::ALL
            .iter()
            .filter_map(|kind| {
                let names = kind.aliases().join("|");
                let pattern = format!(r"(?is)<({names})(\s[^>]*)?>(.*?)</(?:{names})\s*>");
                match Regex::new(&pattern) {
                    Ok(regex) => Some((*kind, regex)),
                    Err(e) => {
                        tracing::error!("Invalid {:?} directive pattern: {}", kind, e);
                        None
                    }
                }
            })
            .collect()
    })
}

fn name_attribute_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"(?i)\bname\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#).ok()
        })
        .as_ref()
}

/// Scan `buffer` for every directive, complete or still streaming, in
/// buffer order.
pub fn scan(buffer: &str) -> Vec<ScannedDirective> {
    let mut found = structural_scan(buffer);

    for candidate in fallback_scan(buffer) {
        let overlaps = found.iter().any(|existing| {
            candidate.span.start < existing.span.end && existing.span.start < candidate.span.end
        });
        if !overlaps {
            found.push(candidate);
        }
    }

    found.sort_by_key(|directive| directive.span.start);
    found
}

/// True when `fragment` (text after a `<` with no `>` yet) could still grow
/// into a directive open tag.
pub fn could_open_directive(fragment: &str) -> bool {
    let normalized: String = fragment
        .trim_start()
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        return true;
    }
    CANONICAL_NAMES.iter().any(|(canonical, _)| {
        canonical.starts_with(&normalized)
            || (normalized.starts_with(canonical) && fragment.contains(char::is_whitespace))
    })
}

fn structural_scan(buffer: &str) -> Vec<ScannedDirective> {
    let mut found = Vec::new();
    for (kind, regex) in structural_patterns() {
        for captures in regex.captures_iter(buffer) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            let attributes = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
            let body = captures.get(3).map(|m| m.as_str()).unwrap_or_default();
            found.push(ScannedDirective {
                kind: *kind,
                body: body.trim().to_string(),
                name: name_attribute(attributes),
                complete: true,
                span: whole.range(),
            });
        }
    }
    found
}

fn fallback_scan(buffer: &str) -> Vec<ScannedDirective> {
    let mut found = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = buffer[cursor..].find('<') {
        let open_start = cursor + rel;
        let Some(rel_gt) = buffer[open_start..].find('>') else {
            break;
        };
        let open_end = open_start + rel_gt + 1;
        let inner = &buffer[open_start + 1..open_end - 1];

        let Some((kind, name_len)) = match_tag_name(inner) else {
            cursor = open_start + 1;
            continue;
        };
        let attributes = &inner[name_len..];

        match find_close(buffer, open_end, kind) {
            Some(close) => {
                found.push(ScannedDirective {
                    kind,
                    body: buffer[open_end..close.start].trim().to_string(),
                    name: name_attribute(attributes),
                    complete: true,
                    span: open_start..close.end,
                });
                cursor = close.end;
            }
            None => {
                found.push(ScannedDirective {
                    kind,
                    body: buffer[open_end..].trim().to_string(),
                    name: name_attribute(attributes),
                    complete: false,
                    span: open_start..buffer.len(),
                });
                cursor = open_end;
            }
        }
    }

    found
}

fn find_close(buffer: &str, from: usize, kind: DirectiveKind) -> Option<Range<usize>> {
    let mut cursor = from;
    while let Some(rel) = buffer[cursor..].find("</") {
        let close_start = cursor + rel;
        let rel_gt = buffer[close_start..].find('>')?;
        let close_end = close_start + rel_gt + 1;
        let inner = &buffer[close_start + 2..close_end - 1];
        if let Some((close_kind, name_len)) = match_tag_name(inner) {
            if close_kind == kind && inner[name_len..].trim().is_empty() {
                return Some(close_start..close_end);
            }
        }
        cursor = close_start + 2;
    }
    None
}

/// Match the tag name at the start of `inner` (text between `<` and `>`).
/// Returns the kind and the byte length consumed by the name.
fn match_tag_name(inner: &str) -> Option<(DirectiveKind, usize)> {
    let leading = inner.len() - inner.trim_start().len();
    let text = &inner[leading..];

    for (canonical, kind) in CANONICAL_NAMES {
        let Some(consumed) = match_normalized(text, canonical) else {
            continue;
        };
        let rest = &text[consumed..];
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            return Some((*kind, leading + consumed));
        }
    }
    None
}

fn match_normalized(text: &str, canonical: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    for (n, expected) in canonical.bytes().enumerate() {
        if n > 0 {
            while i < bytes.len() && matches!(bytes[i], b'_' | b'-' | b' ') {
                i += 1;
            }
        }
        if i >= bytes.len() || !bytes[i].eq_ignore_ascii_case(&expected) {
            return None;
        }
        i += 1;
    }
    Some(i)
}

fn name_attribute(attributes: &str) -> Option<String> {
    let captures = name_attribute_pattern()?.captures(attributes)?;
    (1..=3)
        .find_map(|group| captures.get(group))
        .map(|m| m.as_str().trim().to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(buffer: &str) -> Vec<(DirectiveKind, String)> {
        scan(buffer)
            .into_iter()
            .filter(|d| d.complete)
            .map(|d| (d.kind, d.body))
            .collect()
    }

    #[test]
    fn finds_well_formed_tags_of_every_kind() {
        let buffer = "Sure. <SEARCHREQUEST>rust async</SEARCHREQUEST> then \
                      <IMG>a red fox</IMG> <PAGE># Notes\nbody</PAGE> \
                      <TEXT_FILE name=\"todo.txt\">milk</TEXT_FILE> \
                      <TASK_CREATE>reminder:call mom</TASK_CREATE> \
                      <FUNCTION_CALL>current_time()</FUNCTION_CALL>";
        let kinds: Vec<_> = complete(buffer).into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![
                DirectiveKind::Search,
                DirectiveKind::Image,
                DirectiveKind::Page,
                DirectiveKind::TextFile,
                DirectiveKind::TaskCreate,
                DirectiveKind::FunctionCall,
            ]
        );
    }

    #[test]
    fn matches_aliases_case_insensitively() {
        for buffer in [
            "<search>q</search>",
            "<Search_Request>q</Search_Request>",
            "<websearch>q</websearch>",
            "<WEB_SEARCH>q</WEB_SEARCH>",
            "<SearchRequest>q</SEARCHREQUEST>",
        ] {
            assert_eq!(
                complete(buffer),
                vec![(DirectiveKind::Search, "q".to_string())],
                "buffer: {}",
                buffer
            );
        }
    }

    #[test]
    fn fallback_accepts_unexpected_separators() {
        let found = complete("< SEARCH-REQUEST >weather oslo</SEARCH REQUEST>");
        assert_eq!(
            found,
            vec![(DirectiveKind::Search, "weather oslo".to_string())]
        );

        let found = complete("<Text File name='a.md'>hi</textfile>");
        assert_eq!(found, vec![(DirectiveKind::TextFile, "hi".to_string())]);
    }

    #[test]
    fn open_tag_without_close_is_incomplete() {
        let found = scan("intro <PAGE># Draft\nstill streaming");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, DirectiveKind::Page);
        assert!(!found[0].complete);
        assert_eq!(found[0].body, "# Draft\nstill streaming");
    }

    #[test]
    fn extracts_name_attribute() {
        let found = scan(r#"<TEXT_FILE name="report.txt">x</TEXT_FILE><TEXTFILE>y</TEXTFILE>"#);
        assert_eq!(found[0].name.as_deref(), Some("report.txt"));
        assert_eq!(found[1].name, None);
    }

    #[test]
    fn returns_every_search_in_buffer_order() {
        let found = complete("<SEARCH>one</SEARCH> and <WEBSEARCH>two</WEBSEARCH> <search>three</search>");
        let bodies: Vec<_> = found.into_iter().map(|(_, body)| body).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
    }

    #[test]
    fn recognizes_partial_open_tags() {
        assert!(could_open_directive(""));
        assert!(could_open_directive("SEARCH_RE"));
        assert!(could_open_directive("text fi"));
        assert!(could_open_directive("TEXT_FILE name=\"rep"));
        assert!(!could_open_directive("div class"));
        assert!(!could_open_directive("b"));
    }

    #[test]
    fn ignores_lookalike_tags() {
        assert!(scan("<PAGEBREAK>x</PAGEBREAK> <b>bold</b> a < b > c").is_empty());
        assert!(complete("<img src=\"x.png\">").is_empty());
    }
}
