//! The message envelope (§3 Message) and the handful of content types the
//! routing core actually constructs or inspects.
//!
//! Most message content (`execute_request`, `stream`, `execute_result`, and so
//! on) passes through the bridge and the IOPub tap as an opaque JSON blob —
//! the core forwards bytes, it doesn't interpret cell output. The exceptions
//! are the messages the core itself sends (`kernel_info_request`,
//! `shutdown_request`, `interrupt_request`) and the one it reads to drive the
//! activity tap (`status`, for `content.execution_state`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// A Jupyter message header (§3 Message): `{msg_id, session, username, date,
/// msg_type, version}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Header {
    pub msg_id: String,
    pub username: String,
    pub session: String,
    pub date: DateTime<Utc>,
    pub msg_type: String,
    pub version: String,
}

impl Header {
    pub fn new(msg_type: impl Into<String>, session: impl Into<String>) -> Self {
        Header {
            msg_id: Uuid::new_v4().to_string(),
            username: "zasper".to_string(),
            session: session.into(),
            date: Utc::now(),
            msg_type: msg_type.into(),
            version: "5.3".to_string(),
        }
    }
}

fn serialize_parent_header<S>(
    parent_header: &Option<Header>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match parent_header {
        Some(header) => header.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

fn deserialize_parent_header<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Header>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(None),
        Value::Object(obj) if obj.is_empty() => Ok(None),
        other => serde_json::from_value(other).map(Some).map_err(D::Error::custom),
    }
}

/// A complete Jupyter message: the five logical parts from §3, plus the ZMQ
/// identity frames and the channel it arrived on or is destined for.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JupyterMessage {
    #[serde(skip_serializing, skip_deserializing, default)]
    pub zmq_identities: Vec<bytes::Bytes>,
    pub header: Header,
    #[serde(
        serialize_with = "serialize_parent_header",
        deserialize_with = "deserialize_parent_header"
    )]
    pub parent_header: Option<Header>,
    #[serde(default)]
    pub metadata: Value,
    pub content: Value,
    #[serde(skip_serializing, skip_deserializing, default)]
    pub buffers: Vec<bytes::Bytes>,
    #[serde(skip_serializing, skip_deserializing, default)]
    pub channel: Option<crate::channel::Channel>,
}

impl JupyterMessage {
    /// Builds a fresh message with no parent, e.g. a `kernel_info_request`
    /// sent speculatively on connect.
    pub fn new(msg_type: impl Into<String>, session: impl Into<String>, content: Value) -> Self {
        JupyterMessage {
            zmq_identities: Vec::new(),
            header: Header::new(msg_type, session),
            parent_header: None,
            metadata: Value::Object(Default::default()),
            content,
            buffers: Vec::new(),
            channel: None,
        }
    }

    /// Builds a reply to `self`: same session, fresh `msg_id`, `parent_header`
    /// set to `self.header`, and the identity frames carried over so the
    /// reply routes back to the same ROUTER peer.
    pub fn new_reply(&self, msg_type: impl Into<String>, content: Value) -> Self {
        JupyterMessage {
            zmq_identities: self.zmq_identities.clone(),
            header: Header::new(msg_type, self.header.session.clone()),
            parent_header: Some(self.header.clone()),
            metadata: Value::Object(Default::default()),
            content,
            buffers: Vec::new(),
            channel: self.channel,
        }
    }

    pub fn content_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.content.clone()).map_err(|source| ProtocolError::ParseError {
            msg_type: self.header.msg_type.clone(),
            source,
        })
    }
}

/// `execution_state` values carried by a `status` message on IOPub (§4.4
/// Activity tap).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
    #[serde(other)]
    Other,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Busy => "busy",
            ExecutionState::Idle => "idle",
            ExecutionState::Starting => "starting",
            ExecutionState::Other => "other",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Status {
    pub execution_state: ExecutionState,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    #[default]
    Ok,
    Error,
    Aborted,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReplyError {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct KernelInfoRequest {}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LanguageInfo {
    pub name: String,
    pub version: String,
    pub mimetype: String,
    pub file_extension: String,
    pub pygments_lexer: String,
    pub codemirror_mode: Value,
    pub nbconvert_exporter: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HelpLink {
    pub text: String,
    pub url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KernelInfoReply {
    pub status: ReplyStatus,
    pub protocol_version: String,
    pub implementation: String,
    pub implementation_version: String,
    pub language_info: LanguageInfo,
    pub banner: String,
    #[serde(default)]
    pub help_links: Vec<HelpLink>,
    #[serde(default)]
    pub debugger: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
pub struct ShutdownRequest {
    pub restart: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
pub struct ShutdownReply {
    pub restart: bool,
    pub status: ReplyStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InterruptRequest {}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InterruptReply {
    pub status: ReplyStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_carries_parent_header_and_identities() {
        let mut request = JupyterMessage::new(
            "kernel_info_request",
            "session-1",
            serde_json::to_value(KernelInfoRequest {}).unwrap(),
        );
        request.zmq_identities = vec![bytes::Bytes::from_static(b"peer-1")];

        let reply = request.new_reply(
            "kernel_info_reply",
            serde_json::json!({"status": "ok"}),
        );

        assert_eq!(reply.zmq_identities, request.zmq_identities);
        assert_eq!(reply.parent_header.unwrap().msg_id, request.header.msg_id);
        assert_ne!(reply.header.msg_id, request.header.msg_id);
    }

    #[test]
    fn parent_header_serializes_as_empty_object_when_absent() {
        let msg = JupyterMessage::new("kernel_info_request", "s", Value::Null);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["parent_header"], serde_json::json!({}));
    }

    #[test]
    fn status_content_decodes_execution_state() {
        let msg = JupyterMessage::new(
            "status",
            "s",
            serde_json::json!({"execution_state": "busy"}),
        );
        let status: Status = msg.content_as().unwrap();
        assert_eq!(status.execution_state, ExecutionState::Busy);
    }

    #[test]
    fn unknown_execution_state_falls_back_to_other() {
        let status: Status =
            serde_json::from_value(serde_json::json!({"execution_state": "restarting"}))
                .unwrap();
        assert_eq!(status.execution_state, ExecutionState::Other);
    }
}
