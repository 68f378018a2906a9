//! Stream event records and their typed form.

use refly_common::{BaseResponse, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

/// One `data:` line as the server sends it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillEvent {
    pub event: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Log,
    Stream,
    End,
    Artifact,
    StructuredData,
    CreateNode,
    Usage,
    Error,
}

impl EventKind {
    /// Parse a wire discriminator. `token_usage` is the older name for `usage`.
    pub fn parse(kind: &str) -> Option<Self> {
        Some(match kind {
            "start" => Self::Start,
            "log" => Self::Log,
            "stream" => Self::Stream,
            "end" => Self::End,
            "artifact" => Self::Artifact,
            "structured_data" => Self::StructuredData,
            "create_node" => Self::CreateNode,
            "usage" | "token_usage" => Self::Usage,
            "error" => Self::Error,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Log => "log",
            Self::Stream => "stream",
            Self::End => "end",
            Self::Artifact => "artifact",
            Self::StructuredData => "structured_data",
            Self::CreateNode => "create_node",
            Self::Usage => "usage",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields every event carries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMeta {
    pub result_id: Option<String>,
    pub step: Option<Value>,
}

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    SkillStart {
        meta: EventMeta,
    },
    Log {
        meta: EventMeta,
        log: Value,
    },
    Stream {
        meta: EventMeta,
        content: String,
        reasoning_content: Option<String>,
    },
    SkillEnd {
        meta: EventMeta,
    },
    Artifact {
        meta: EventMeta,
        artifact: Value,
    },
    StructuredData {
        meta: EventMeta,
        data: Value,
    },
    CreateNode {
        meta: EventMeta,
        node: Value,
    },
    Usage {
        meta: EventMeta,
        usage: Value,
    },
    Error {
        meta: EventMeta,
        error: BaseResponse,
        origin: Option<String>,
    },
}

impl StreamEvent {
    /// Type a wire record. Returns `None` for unknown kinds.
    pub fn from_record(record: SkillEvent) -> Option<Self> {
        let kind = EventKind::parse(&record.event)?;
        let meta = EventMeta {
            result_id: record.result_id,
            step: record.step,
        };
        let content = record.content;

        Some(match kind {
            EventKind::Start => Self::SkillStart { meta },
            EventKind::End => Self::SkillEnd { meta },
            EventKind::Log => Self::Log {
                meta,
                log: or_content(record.log, &content),
            },
            EventKind::Stream => Self::Stream {
                meta,
                content: match content {
                    Some(Value::String(text)) => text,
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                },
                reasoning_content: record.reasoning_content,
            },
            EventKind::Artifact => Self::Artifact {
                meta,
                artifact: or_content(record.artifact, &content),
            },
            EventKind::StructuredData => Self::StructuredData {
                meta,
                data: or_content(record.structured_data, &content),
            },
            EventKind::CreateNode => Self::CreateNode {
                meta,
                node: or_content(record.node, &content),
            },
            EventKind::Usage => Self::Usage {
                meta,
                usage: or_content(record.token_usage, &content),
            },
            EventKind::Error => Self::Error {
                meta,
                error: parse_error_payload(record.error.or(content)),
                origin: record.origin_error,
            },
        })
    }

    /// Error raised on this side of the connection rather than by the server.
    pub fn failure(error: BaseResponse) -> Self {
        Self::Error {
            meta: EventMeta::default(),
            error,
            origin: None,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::SkillStart { .. } => EventKind::Start,
            Self::Log { .. } => EventKind::Log,
            Self::Stream { .. } => EventKind::Stream,
            Self::SkillEnd { .. } => EventKind::End,
            Self::Artifact { .. } => EventKind::Artifact,
            Self::StructuredData { .. } => EventKind::StructuredData,
            Self::CreateNode { .. } => EventKind::CreateNode,
            Self::Usage { .. } => EventKind::Usage,
            Self::Error { .. } => EventKind::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::SkillStart { meta }
            | Self::Log { meta, .. }
            | Self::Stream { meta, .. }
            | Self::SkillEnd { meta }
            | Self::Artifact { meta, .. }
            | Self::StructuredData { meta, .. }
            | Self::CreateNode { meta, .. }
            | Self::Usage { meta, .. }
            | Self::Error { meta, .. } => meta,
        }
    }
}

/// The dedicated field when present, else the generic `content`.
fn or_content(field: Option<Value>, content: &Option<Value>) -> Value {
    field.or_else(|| content.clone()).unwrap_or(Value::Null)
}

/// Error payloads arrive either as an envelope object or as a string holding
/// a JSON-encoded envelope.
fn parse_error_payload(payload: Option<Value>) -> BaseResponse {
    let parsed = match payload {
        Some(Value::String(text)) => match serde_json::from_str::<BaseResponse>(&text) {
            Ok(envelope) => Ok(envelope),
            Err(_) => Err(text),
        },
        Some(value @ Value::Object(_)) => {
            serde_json::from_value::<BaseResponse>(value.clone()).map_err(|_| value.to_string())
        }
        Some(Value::Null) | None => Err(String::new()),
        Some(other) => Err(other.to_string()),
    };
    match parsed {
        Ok(mut envelope) => {
            envelope.success = false;
            envelope
        }
        Err(text) if text.is_empty() => BaseResponse::from_code(ErrorCode::Unknown),
        Err(text) => BaseResponse::failure(ErrorCode::Unknown, text),
    }
}
