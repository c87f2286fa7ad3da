// Stream-json protocol for the external agent CLI
// Parses newline-delimited JSON output into typed events and builds the
// input envelopes written to the process's stdin

use serde_json::{json, Value};

/// A typed event parsed from one line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Assistant-authored text content
    AssistantText(String),
    /// The agent started a tool invocation
    ToolUse {
        tool_id: String,
        tool_name: String,
        input: Value,
    },
    /// Token usage reported by the agent
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        cache_creation_tokens: u64,
    },
    /// Terminal result marker for the current turn
    Result { is_error: bool, detail: String },
    /// The agent switched into plan mode
    EnterPlanMode,
    /// The agent proposed a plan and is halting for approval
    ExitPlanMode { plan: String },
    /// The requested session id was rejected by the agent
    SessionNotFound { session_id: String },
    /// A line that was not parseable as a known event; kept, never dropped
    RawText(String),
}

/// Incremental line-oriented parser over the agent's stdout bytes.
///
/// Bytes are buffered until a newline; each complete line becomes zero or
/// more events. Unknown event types and non-JSON lines degrade to RawText.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: String,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of output; returns events for every completed line.
    pub fn push(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }
            events.extend(parse_line(line));
        }
        events
    }

    /// Drain any trailing partial line at stream end.
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            Vec::new()
        } else {
            parse_line(rest)
        }
    }
}

/// Parse one complete line of agent output.
fn parse_line(line: &str) -> Vec<StreamEvent> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return vec![StreamEvent::RawText(line.to_string())],
    };

    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match event_type {
        "assistant" => parse_assistant(&value),
        "system" => parse_system(&value),
        "result" => vec![parse_result(&value)],
        // User echoes and control acks carry nothing we surface
        "user" | "control_response" => Vec::new(),
        _ => vec![StreamEvent::RawText(line.to_string())],
    }
}

fn parse_assistant(value: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let message = value.get("message").unwrap_or(value);

    if let Some(usage) = message.get("usage") {
        events.push(StreamEvent::Usage {
            input_tokens: usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            cache_read_tokens: usage
                .get("cache_read_input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            cache_creation_tokens: usage
                .get("cache_creation_input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        });
    }

    if let Some(blocks) = message.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            events.push(StreamEvent::AssistantText(text.to_string()));
                        }
                    }
                }
                Some("tool_use") => {
                    let tool_name = block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("")
                        .to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    match tool_name.as_str() {
                        "ExitPlanMode" | "exit_plan_mode" => {
                            let plan = input
                                .get("plan")
                                .and_then(|p| p.as_str())
                                .unwrap_or("")
                                .to_string();
                            events.push(StreamEvent::ExitPlanMode { plan });
                        }
                        _ => {
                            events.push(StreamEvent::ToolUse {
                                tool_id: block
                                    .get("id")
                                    .and_then(|i| i.as_str())
                                    .unwrap_or("")
                                    .to_string(),
                                tool_name,
                                input,
                            });
                        }
                    }
                }
                _ => {}
            }
        }
    } else if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            events.push(StreamEvent::AssistantText(text.to_string()));
        }
    }

    events
}

fn parse_system(value: &Value) -> Vec<StreamEvent> {
    match value.get("subtype").and_then(|s| s.as_str()) {
        Some("plan_mode_entered") => vec![StreamEvent::EnterPlanMode],
        Some("plan_mode_exited") => {
            let plan = value
                .get("plan")
                .and_then(|p| p.as_str())
                .unwrap_or("")
                .to_string();
            vec![StreamEvent::ExitPlanMode { plan }]
        }
        // Init and other subtypes are informational only
        _ => Vec::new(),
    }
}

fn parse_result(value: &Value) -> StreamEvent {
    let is_error = value
        .get("is_error")
        .and_then(|e| e.as_bool())
        .unwrap_or(false)
        || value
            .get("subtype")
            .and_then(|s| s.as_str())
            .map(|s| s.starts_with("error"))
            .unwrap_or(false);
    let detail = value
        .get("result")
        .and_then(|r| r.as_str())
        .map(|s| s.to_string())
        .unwrap_or_default();

    if is_error {
        if let Some(session_id) = extract_missing_session(&detail) {
            return StreamEvent::SessionNotFound { session_id };
        }
    }

    StreamEvent::Result { is_error, detail }
}

/// Detect the "no conversation found with session id" error the agent emits
/// when asked to resume a session it does not know.
fn extract_missing_session(detail: &str) -> Option<String> {
    let lower = detail.to_lowercase();
    if !lower.contains("session") {
        return None;
    }
    if !(lower.contains("no conversation found")
        || lower.contains("not found")
        || lower.contains("already in use"))
    {
        return None;
    }
    // Pull the id out of the message when present; fall back to empty
    let id = detail
        .split_whitespace()
        .find(|word| uuid::Uuid::parse_str(word.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-')).is_ok())
        .map(|word| word.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-').to_string())
        .unwrap_or_default();
    Some(id)
}

/// Envelope for a plain text user message.
pub fn user_message_envelope(text: &str) -> String {
    json!({
        "type": "user",
        "message": { "role": "user", "content": text }
    })
    .to_string()
}

/// Envelope for structured content blocks (text plus images).
pub fn user_blocks_envelope(blocks: &Value) -> String {
    json!({
        "type": "user",
        "message": { "role": "user", "content": blocks }
    })
    .to_string()
}

/// Envelope answering a pending tool-use request.
pub fn tool_result_envelope(tool_use_id: &str, content: &str) -> String {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content
            }]
        }
    })
    .to_string()
}
