//! Incremental decoder for the agent CLI's newline-delimited JSON output.
//!
//! The CLI (run with `--output-format stream-json --verbose`) writes one JSON
//! record per line: `system`, `assistant`, `user` and a final `result`
//! record, plus the lower-level streaming primitives (`content_block_delta`,
//! `message_stop`, ...) when they are passed through. Output arrives from the
//! pseudo-terminal in arbitrary chunks, so [`StreamParser`] carries the
//! unterminated tail of each chunk over to the next call.
//!
//! Decoding never fails: a line that is not JSON is surfaced as partial
//! [`StreamEvent::Content`], and JSON of an unrecognized shape becomes
//! [`StreamEvent::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::MessageRole;

/// One semantic event decoded from the output stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Text. `partial` marks streaming deltas and raw, non-JSON lines.
    Content {
        text: String,
        partial: bool,
        role: Option<MessageRole>,
    },
    /// A tool invocation. Streaming input deltas carry the raw partial JSON
    /// string as `input` with `partial` set.
    ToolUse {
        id: Option<String>,
        name: Option<String>,
        input: Value,
        partial: bool,
    },
    ToolResult {
        id: Option<String>,
        content: String,
        is_error: bool,
    },
    MessageStart,
    MessageComplete {
        stop_reason: Option<String>,
    },
    System {
        subtype: Option<String>,
        session_id: Option<String>,
    },
    /// The CLI's closing `result` record for a turn.
    TurnComplete {
        is_error: bool,
        result: Option<String>,
        usage: Option<Usage>,
    },
    Error {
        message: String,
    },
    /// Keepalives and record shapes this parser does not know.
    Unknown {
        raw: Value,
    },
}

impl StreamEvent {
    /// Whether this event ends an assistant message.
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            StreamEvent::MessageComplete { .. } | StreamEvent::TurnComplete { .. }
        )
    }

    fn raw_line(text: String) -> Self {
        StreamEvent::Content {
            text,
            partial: true,
            role: None,
        }
    }
}

/// Token counters reported on the `result` record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

// ─── Wire records ───

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireRecord {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        #[serde(default)]
        message: Option<WireMessage>,
    },
    User {
        #[serde(default)]
        message: Option<WireMessage>,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<Usage>,
    },
    ContentBlockDelta {
        #[serde(default)]
        delta: Option<WireDelta>,
    },
    ContentBlockStart {
        #[serde(default)]
        content_block: Option<WireBlock>,
    },
    MessageStart,
    MessageDelta {
        #[serde(default)]
        delta: Option<WireStop>,
    },
    MessageStop,
    Error {
        #[serde(default)]
        error: Option<WireError>,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: WireToolContent,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: WireContent,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireContent {
    Blocks(Vec<WireBlock>),
    Text(String),
}

impl Default for WireContent {
    fn default() -> Self {
        WireContent::Blocks(Vec::new())
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: WireToolContent,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Tool output is either a plain string or a list of text parts.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireToolContent {
    Text(String),
    Parts(Vec<WireTextPart>),
    Null,
}

impl Default for WireToolContent {
    fn default() -> Self {
        WireToolContent::Null
    }
}

impl WireToolContent {
    fn into_text(self) -> String {
        match self {
            WireToolContent::Text(text) => text,
            WireToolContent::Parts(parts) => parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("\n"),
            WireToolContent::Null => String::new(),
        }
    }
}

#[derive(Deserialize)]
struct WireTextPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta {
        #[serde(default)]
        text: String,
    },
    InputJsonDelta {
        #[serde(default)]
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireStop {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    message: Option<String>,
}

// ─── Parser ───

/// Line-buffering parser. One instance per controller, [`reset`](Self::reset)
/// between process generations.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and decode every line it completes.
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        let mut events = Vec::new();
        for line in complete.split(|&b| b == b'\n') {
            events.extend(decode_line(line));
        }
        events
    }

    /// Surface the unterminated tail, if any, as partial content.
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        let tail = std::mem::take(&mut self.buffer);
        let text = line_text(&tail);
        if text.trim().is_empty() {
            return Vec::new();
        }
        vec![StreamEvent::raw_line(text)]
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn line_text(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Decode one complete line into zero or more events.
fn decode_line(line: &[u8]) -> Vec<StreamEvent> {
    let text = line_text(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return vec![StreamEvent::raw_line(text)],
    };
    if !value.is_object() {
        return vec![StreamEvent::Unknown { raw: value }];
    }
    match WireRecord::deserialize(&value) {
        Ok(record) => decode_record(record, value),
        Err(_) => vec![StreamEvent::Unknown { raw: value }],
    }
}

fn decode_record(record: WireRecord, raw: Value) -> Vec<StreamEvent> {
    let unknown = |raw| vec![StreamEvent::Unknown { raw }];
    match record {
        WireRecord::System {
            subtype,
            session_id,
        } => vec![StreamEvent::System {
            subtype,
            session_id,
        }],
        WireRecord::Assistant { message } => {
            let events = message_events(message, MessageRole::Assistant);
            if events.is_empty() { unknown(raw) } else { events }
        }
        WireRecord::User { message } => {
            let events = message_events(message, MessageRole::User);
            if events.is_empty() { unknown(raw) } else { events }
        }
        WireRecord::Result {
            is_error,
            result,
            usage,
        } => vec![StreamEvent::TurnComplete {
            is_error,
            result,
            usage,
        }],
        WireRecord::ContentBlockDelta { delta } => match delta {
            Some(WireDelta::TextDelta { text }) => vec![StreamEvent::Content {
                text,
                partial: true,
                role: Some(MessageRole::Assistant),
            }],
            Some(WireDelta::InputJsonDelta { partial_json }) => vec![StreamEvent::ToolUse {
                id: None,
                name: None,
                input: Value::String(partial_json),
                partial: true,
            }],
            _ => unknown(raw),
        },
        WireRecord::ContentBlockStart { content_block } => match content_block {
            Some(WireBlock::ToolUse { id, name, .. }) => vec![StreamEvent::ToolUse {
                id,
                name,
                input: Value::Object(Default::default()),
                partial: false,
            }],
            _ => unknown(raw),
        },
        WireRecord::MessageStart => vec![StreamEvent::MessageStart],
        WireRecord::MessageStop => vec![StreamEvent::MessageComplete { stop_reason: None }],
        WireRecord::MessageDelta { delta } => match delta.and_then(|d| d.stop_reason) {
            Some(reason) => vec![StreamEvent::MessageComplete {
                stop_reason: Some(reason),
            }],
            None => unknown(raw),
        },
        WireRecord::Error { error } => vec![StreamEvent::Error {
            message: error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "Unknown error".to_string()),
        }],
        WireRecord::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => vec![StreamEvent::ToolResult {
            id: tool_use_id,
            content: content.into_text(),
            is_error,
        }],
        WireRecord::Other => unknown(raw),
    }
}

/// One event per recognized content block, in order.
fn message_events(message: Option<WireMessage>, role: MessageRole) -> Vec<StreamEvent> {
    let Some(message) = message else {
        return Vec::new();
    };
    let blocks = match message.content {
        WireContent::Text(text) => {
            return vec![StreamEvent::Content {
                text,
                partial: false,
                role: Some(role),
            }];
        }
        WireContent::Blocks(blocks) => blocks,
    };
    blocks
        .into_iter()
        .filter_map(|block| match block {
            WireBlock::Text { text } => Some(StreamEvent::Content {
                text,
                partial: false,
                role: Some(role),
            }),
            WireBlock::ToolUse { id, name, input } => Some(StreamEvent::ToolUse {
                id,
                name,
                input,
                partial: false,
            }),
            WireBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(StreamEvent::ToolResult {
                id: tool_use_id,
                content: content.into_text(),
                is_error,
            }),
            WireBlock::Other => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TRANSCRIPT: &str = concat!(
        r#"{"type":"system","subtype":"init","session_id":"abc-123"}"#,
        "\n",
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking at the bug."},{"type":"tool_use","id":"toolu_1","name":"Read","input":{"file_path":"src/auth.rs"}}]}}"#,
        "\n",
        "plain stderr noise\n",
        "\n",
        r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"fn login() {}","is_error":false}]}}"#,
        "\r\n",
        r#"{"type":"result","subtype":"success","is_error":false,"result":"Done","usage":{"input_tokens":120,"output_tokens":45}}"#,
        "\n",
        "trailing without newline"
    );

    fn parse_all(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut parser = StreamParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.parse(chunk));
        }
        events.extend(parser.flush());
        events
    }

    #[test]
    fn decodes_a_full_turn() {
        let events = parse_all(&[TRANSCRIPT.as_bytes()]);
        assert_eq!(
            events,
            vec![
                StreamEvent::System {
                    subtype: Some("init".into()),
                    session_id: Some("abc-123".into()),
                },
                StreamEvent::Content {
                    text: "Looking at the bug.".into(),
                    partial: false,
                    role: Some(MessageRole::Assistant),
                },
                StreamEvent::ToolUse {
                    id: Some("toolu_1".into()),
                    name: Some("Read".into()),
                    input: json!({"file_path": "src/auth.rs"}),
                    partial: false,
                },
                StreamEvent::Content {
                    text: "plain stderr noise".into(),
                    partial: true,
                    role: None,
                },
                StreamEvent::ToolResult {
                    id: Some("toolu_1".into()),
                    content: "fn login() {}".into(),
                    is_error: false,
                },
                StreamEvent::TurnComplete {
                    is_error: false,
                    result: Some("Done".into()),
                    usage: Some(Usage {
                        input_tokens: 120,
                        output_tokens: 45,
                    }),
                },
                StreamEvent::Content {
                    text: "trailing without newline".into(),
                    partial: true,
                    role: None,
                },
            ]
        );
    }

    #[test]
    fn splitting_at_any_byte_offset_yields_the_same_events() {
        let bytes = TRANSCRIPT.as_bytes();
        let whole = parse_all(&[bytes]);
        for offset in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(offset);
            assert_eq!(parse_all(&[head, tail]), whole, "split at byte {offset}");
        }
    }

    #[test]
    fn split_multibyte_characters_are_reassembled() {
        let line = "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"héllo ✓\"}]}}\n";
        let bytes = line.as_bytes();
        let check = bytes.iter().position(|&b| b == 0xE2).unwrap();
        let events = parse_all(&[&bytes[..check + 1], &bytes[check + 1..]]);
        assert!(matches!(&events[0], StreamEvent::Content { text, .. } if text == "héllo ✓"));
    }

    #[test]
    fn invalid_utf8_is_kept_lossily() {
        let events = parse_all(&[b"bad \xff byte\n"]);
        assert!(matches!(&events[0], StreamEvent::Content { text, partial: true, .. } if text.starts_with("bad ")));
    }

    #[test]
    fn keepalives_and_unknown_shapes_are_neutral() {
        let events = parse_all(&[
            b"{\"type\":\"ping\"}\n{\"type\":\"brand_new\",\"x\":1}\n{\"no_type\":true}\n42\n",
        ]);
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| matches!(e, StreamEvent::Unknown { .. })));
    }

    #[test]
    fn streaming_primitives_map_to_partial_events() {
        let input = concat!(
            r#"{"type":"message_start","message":{}}"#,
            "\n",
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"Bash"}}"#,
            "\n",
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}"#,
            "\n",
            r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{\"cmd\":"}}"#,
            "\n",
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"}}"#,
            "\n",
            r#"{"type":"message_stop"}"#,
            "\n",
            r#"{"type":"error","error":{"message":"overloaded"}}"#,
            "\n",
        );
        let events = parse_all(&[input.as_bytes()]);
        assert_eq!(events[0], StreamEvent::MessageStart);
        assert!(matches!(&events[1], StreamEvent::ToolUse { name: Some(n), partial: false, .. } if n == "Bash"));
        assert!(matches!(&events[2], StreamEvent::Content { text, partial: true, .. } if text == "Hel"));
        assert!(matches!(&events[3], StreamEvent::ToolUse { input: Value::String(s), partial: true, .. } if s == "{\"cmd\":"));
        assert_eq!(
            events[4],
            StreamEvent::MessageComplete {
                stop_reason: Some("end_turn".into())
            }
        );
        assert_eq!(events[5], StreamEvent::MessageComplete { stop_reason: None });
        assert_eq!(
            events[6],
            StreamEvent::Error {
                message: "overloaded".into()
            }
        );
    }

    #[test]
    fn tool_result_parts_are_joined() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t","is_error":true,"content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}]}}"#;
        let events = parse_all(&[line.as_bytes(), b"\n"]);
        assert_eq!(
            events,
            vec![StreamEvent::ToolResult {
                id: Some("t".into()),
                content: "a\nb".into(),
                is_error: true,
            }]
        );
    }

    #[test]
    fn reset_drops_the_carry_over() {
        let mut parser = StreamParser::new();
        assert!(parser.parse(b"{\"type\":\"sys").is_empty());
        assert!(parser.has_pending());
        parser.reset();
        assert!(!parser.has_pending());
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let json = serde_json::to_value(StreamEvent::MessageComplete { stop_reason: None }).unwrap();
        assert_eq!(json["type"], "message_complete");
    }
}
