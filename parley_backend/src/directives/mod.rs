//! Inline directive tags embedded in streamed assistant output.
//!
//! A directive is a `<TAG>body</TAG>` pair (case-insensitive, several aliases
//! per kind). `scanner` turns a buffer into a list of [`ScannedDirective`]s,
//! `detector` tracks which of them already fired for the current message, and
//! the helpers below parse the bodies of the structured kinds.

pub mod detector;
pub mod scanner;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use detector::{Detection, DirectiveDetector};
pub use scanner::{could_open_directive, scan, ScannedDirective};

use crate::conversation::TaskRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    Search,
    Image,
    Page,
    TextFile,
    TaskCreate,
    FunctionCall,
}

impl DirectiveKind {
    pub const ALL: [DirectiveKind; 6] = [
        DirectiveKind::Search,
        DirectiveKind::Image,
        DirectiveKind::Page,
        DirectiveKind::TextFile,
        DirectiveKind::TaskCreate,
        DirectiveKind::FunctionCall,
    ];

    /// Tag names accepted by the structural pass, longest first so that
    /// `SEARCHREQUEST` wins over `SEARCH`.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            DirectiveKind::Search => &[
                "SEARCHREQUEST",
                "SEARCH_REQUEST",
                "WEB_SEARCH",
                "WEBSEARCH",
                "SEARCH",
            ],
            DirectiveKind::Image => &["IMG"],
            DirectiveKind::Page => &["PAGE"],
            DirectiveKind::TextFile => &["TEXT_FILE", "TEXT FILE", "TEXTFILE"],
            DirectiveKind::TaskCreate => &["TASK_CREATE"],
            DirectiveKind::FunctionCall => &["FUNCTION_CALL"],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DirectiveKind::Search => "search",
            DirectiveKind::Image => "image",
            DirectiveKind::Page => "page",
            DirectiveKind::TextFile => "text file",
            DirectiveKind::TaskCreate => "task",
            DirectiveKind::FunctionCall => "function call",
        }
    }
}

impl std::fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Parse a `TASK_CREATE` body of the form `type:query`.
pub fn parse_task(body: &str) -> Result<TaskRecord> {
    let (task_type, query) = body
        .split_once(':')
        .ok_or_else(|| anyhow!("Task directive must look like 'type:query', got '{}'", body))?;
    let task_type = task_type.trim().to_ascii_lowercase();
    let query = query.trim();
    if task_type.is_empty() || query.is_empty() {
        bail!("Task directive needs both a type and a query");
    }
    Ok(TaskRecord {
        task_type,
        query: query.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInvocation {
    pub name: String,
    pub arguments: Value,
}

/// Parse a `FUNCTION_CALL` body of the form `name(args)`.
///
/// Arguments may be a JSON object (`name({"a": 1})`) or a comma separated list
/// of `key=value` pairs. Values are quoted strings, JSON scalars/arrays, or bare
/// words; positional values are keyed `arg0`, `arg1`, ...
pub fn parse_function_call(body: &str) -> Result<FunctionInvocation> {
    let body = body.trim();
    let open = body
        .find('(')
        .ok_or_else(|| anyhow!("Function call '{}' is missing an argument list", body))?;
    let close = body
        .rfind(')')
        .filter(|close| *close > open)
        .ok_or_else(|| anyhow!("Function call '{}' has an unterminated argument list", body))?;
    if !body[close + 1..].trim().is_empty() {
        bail!("Unexpected text after function call arguments in '{}'", body);
    }

    let name = body[..open].trim();
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        bail!("Invalid function name '{}'", name);
    }

    let raw_args = body[open + 1..close].trim();
    let arguments = if raw_args.is_empty() {
        Value::Object(Map::new())
    } else if raw_args.starts_with('{') {
        let value: Value = serde_json::from_str(raw_args)
            .with_context(|| format!("Invalid JSON arguments for '{}'", name))?;
        if !value.is_object() {
            bail!("JSON arguments for '{}' must be an object", name);
        }
        value
    } else {
        Value::Object(parse_argument_list(raw_args)?)
    };

    Ok(FunctionInvocation {
        name: name.to_string(),
        arguments,
    })
}

fn parse_argument_list(raw: &str) -> Result<Map<String, Value>> {
    let mut arguments = Map::new();
    for (position, part) in split_top_level(raw)?.into_iter().enumerate() {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match split_key_value(part) {
            Some((key, value)) => {
                arguments.insert(key.to_string(), parse_value(value)?);
            }
            None => {
                arguments.insert(format!("arg{}", position), parse_value(part)?);
            }
        }
    }
    Ok(arguments)
}

fn split_top_level(raw: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth = 0usize;
    let mut start = 0;

    for (idx, c) in raw.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '[' | '{' | '(' => depth += 1,
            ']' | '}' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&raw[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        bail!("Unterminated string in function arguments");
    }
    parts.push(&raw[start..]);
    Ok(parts)
}

fn split_key_value(part: &str) -> Option<(&str, &str)> {
    let eq = part.find('=')?;
    let key = part[..eq].trim();
    let is_identifier = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    is_identifier.then(|| (key, part[eq + 1..].trim()))
}

fn parse_value(raw: &str) -> Result<Value> {
    let raw = raw.trim();
    let mut chars = raw.chars();
    if let (Some(first), Some(last)) = (chars.next(), raw.chars().last()) {
        if raw.len() >= 2 && (first == '"' || first == '\'') && last == first {
            return Ok(Value::String(unescape(&raw[1..raw.len() - 1])));
        }
    }
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Ok(value);
    }
    Ok(Value::String(raw.to_string()))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
