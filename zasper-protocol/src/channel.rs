use serde::{Deserialize, Serialize};

/// The five logical Jupyter channels (§3 GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Control,
    Stdin,
    #[serde(rename = "iopub")]
    IoPub,
    #[serde(rename = "hb")]
    Heartbeat,
}

impl Channel {
    /// The wire-protocol channel tag used by both the v1 and legacy
    /// WebSocket protocols (§4.5).
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Control => "control",
            Channel::Stdin => "stdin",
            Channel::IoPub => "iopub",
            Channel::Heartbeat => "hb",
        }
    }

    pub fn from_str(s: &str) -> Option<Channel> {
        match s {
            "shell" => Some(Channel::Shell),
            "control" => Some(Channel::Control),
            "stdin" => Some(Channel::Stdin),
            "iopub" => Some(Channel::IoPub),
            "hb" => Some(Channel::Heartbeat),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_tag() {
        for channel in [
            Channel::Shell,
            Channel::Control,
            Channel::Stdin,
            Channel::IoPub,
            Channel::Heartbeat,
        ] {
            assert_eq!(Channel::from_str(channel.as_str()), Some(channel));
        }
    }

    #[test]
    fn unknown_tag_is_none() {
        assert_eq!(Channel::from_str("bogus"), None);
    }
}
