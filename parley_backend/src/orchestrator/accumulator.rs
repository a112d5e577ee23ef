use crate::collaborators::StreamChunk;
use crate::conversation::{ExecutableCode, GeneratedImage};

/// What a single chunk contributed.
#[derive(Debug, Default, PartialEq)]
pub struct ChunkEffects {
    pub appended: String,
    pub executable_code: Option<ExecutableCode>,
    pub generated_images: Option<Vec<GeneratedImage>>,
}

/// Concatenates stream fragments in arrival order.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    full_content: String,
}

impl ChunkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full_content(&self) -> &str {
        &self.full_content
    }

    pub fn on_chunk(&mut self, chunk: StreamChunk) -> ChunkEffects {
        match chunk {
            StreamChunk::Text(text) => {
                self.full_content.push_str(&text);
                ChunkEffects {
                    appended: text,
                    ..Default::default()
                }
            }
            StreamChunk::Payload(payload) => {
                let appended = payload.content.unwrap_or_default();
                self.full_content.push_str(&appended);
                ChunkEffects {
                    appended,
                    executable_code: payload.executable_code,
                    generated_images: payload.generated_images,
                }
            }
        }
    }
}

/// First fenced code block in `text`, with its language tag.
pub fn first_fenced_code(text: &str) -> Option<ExecutableCode> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    let newline = after_fence.find('\n')?;
    let language = after_fence[..newline].trim();
    let body_start = newline + 1;
    let close = after_fence[body_start..].find("```")?;
    let code = after_fence[body_start..body_start + close].trim_end();
    if code.trim().is_empty() {
        return None;
    }
    Some(ExecutableCode {
        code: code.to_string(),
        language: if language.is_empty() {
            "python".to_string()
        } else {
            language.to_ascii_lowercase()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ChunkPayload;

    #[test]
    fn accumulates_text_and_payload_content_in_order() {
        let mut acc = ChunkAccumulator::new();
        acc.on_chunk(StreamChunk::Text("Here ".to_string()));
        let effects = acc.on_chunk(StreamChunk::Payload(ChunkPayload {
            content: Some("is a chart".to_string()),
            executable_code: Some(ExecutableCode {
                code: "plot()".to_string(),
                language: "python".to_string(),
            }),
            generated_images: None,
        }));

        assert_eq!(acc.full_content(), "Here is a chart");
        assert_eq!(effects.appended, "is a chart");
        assert!(effects.executable_code.is_some());
    }

    #[test]
    fn extracts_first_fenced_block() {
        let text = "Sure:\n```Python\nimport matplotlib\nplot()\n```\nand ```js\nx\n```";
        let code = first_fenced_code(text).unwrap();
        assert_eq!(code.language, "python");
        assert_eq!(code.code, "import matplotlib\nplot()");

        assert!(first_fenced_code("no code here").is_none());
        assert!(first_fenced_code("```\nunterminated").is_none());
    }
}
