//! The connection-file shape shared between a kernel manager and the kernel
//! process it launches.
//!
//! A `ConnectionInfo` is immutable once written to disk: every field here is
//! either pre-assigned by the caller or discovered once at kernel start and
//! never mutated afterward.

use serde::{Deserialize, Serialize};

/// Transport used for the five ZeroMQ channels.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Ipc,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Ipc => write!(f, "ipc"),
        }
    }
}

/// The bit-exact connection-file shape (§6): these nine keys round-trip
/// through `write` then `read` unchanged, and are the only fields compared
/// during reconciliation (§4.1).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConnectionInfo {
    pub ip: String,
    pub transport: Transport,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    pub key: String,
    pub signature_scheme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

fn form_url(transport: &Transport, ip: &str, port: u16) -> String {
    format!("{}://{}:{}", transport, ip, port)
}

impl ConnectionInfo {
    pub fn shell_url(&self) -> String {
        form_url(&self.transport, &self.ip, self.shell_port)
    }

    pub fn iopub_url(&self) -> String {
        form_url(&self.transport, &self.ip, self.iopub_port)
    }

    pub fn stdin_url(&self) -> String {
        form_url(&self.transport, &self.ip, self.stdin_port)
    }

    pub fn control_url(&self) -> String {
        form_url(&self.transport, &self.ip, self.control_port)
    }

    pub fn hb_url(&self) -> String {
        form_url(&self.transport, &self.ip, self.hb_port)
    }

    /// The nine keys compared during §4.1 reconciliation, in a fixed order so
    /// callers can diff two `ConnectionInfo` values without re-deriving the
    /// key list.
    pub fn reconciliation_eq(&self, other: &ConnectionInfo) -> bool {
        self.key == other.key
            && self.ip == other.ip
            && self.stdin_port == other.stdin_port
            && self.iopub_port == other.iopub_port
            && self.shell_port == other.shell_port
            && self.control_port == other.control_port
            && self.hb_port == other.hb_port
            && self.transport == other.transport
            && self.signature_scheme == other.signature_scheme
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnectionInfo {
        ConnectionInfo {
            ip: "127.0.0.1".to_string(),
            transport: Transport::Tcp,
            shell_port: 1,
            iopub_port: 2,
            stdin_port: 3,
            control_port: 4,
            hb_port: 5,
            key: "k".to_string(),
            signature_scheme: "hmac-sha256".to_string(),
            kernel_name: Some("python3".to_string()),
        }
    }

    #[test]
    fn urls_are_formatted_per_channel() {
        let info = sample();
        assert_eq!(info.shell_url(), "tcp://127.0.0.1:1");
        assert_eq!(info.iopub_url(), "tcp://127.0.0.1:2");
        assert_eq!(info.hb_url(), "tcp://127.0.0.1:5");
    }

    #[test]
    fn reconciliation_ignores_kernel_name() {
        let mut other = sample();
        other.kernel_name = None;
        assert!(sample().reconciliation_eq(&other));
    }

    #[test]
    fn reconciliation_catches_port_drift() {
        let mut other = sample();
        other.shell_port = 9999;
        assert!(!sample().reconciliation_eq(&other));
    }

    #[test]
    fn json_round_trip_preserves_canonical_keys() {
        let info = sample();
        let json = serde_json::to_string(&info).unwrap();
        let back: ConnectionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, back);
    }
}
