//! The on-disk `kernel.json` shape (§3 Kernel Spec, §6 Kernel spec files).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How `KernelManager::interrupt` should reach a running kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterruptMode {
    /// Send a platform signal (SIGINT or equivalent) directly to the process.
    #[default]
    Signal,
    /// Send an `interrupt_request` over the control channel instead.
    Message,
}

/// The parsed contents of a `kernel.json` file.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JupyterKernelspec {
    /// Command-line template. Must contain `{connection_file}`; may contain
    /// `{resource_dir}`.
    #[serde(default)]
    pub argv: Vec<String>,
    pub display_name: String,
    pub language: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub interrupt_mode: InterruptMode,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

impl JupyterKernelspec {
    /// The `metadata.cull_idle_timeout` override described in §4.4, if set
    /// and non-negative.
    pub fn cull_idle_timeout_override(&self) -> Option<u64> {
        self.metadata
            .as_ref()?
            .get("cull_idle_timeout")?
            .as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_mode_defaults_to_signal() {
        let json = r#"{"argv":["python3"],"display_name":"Python 3","language":"python"}"#;
        let spec: JupyterKernelspec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.interrupt_mode, InterruptMode::Signal);
    }

    #[test]
    fn interrupt_mode_message_parses() {
        let json = r#"{"argv":[],"display_name":"Rust","language":"rust","interrupt_mode":"message"}"#;
        let spec: JupyterKernelspec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.interrupt_mode, InterruptMode::Message);
    }

    #[test]
    fn cull_override_reads_from_metadata() {
        let json = r#"{"argv":[],"display_name":"R","language":"r","metadata":{"cull_idle_timeout":120}}"#;
        let spec: JupyterKernelspec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.cull_idle_timeout_override(), Some(120));
    }
}
