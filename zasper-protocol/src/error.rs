#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("error deserializing content for msg_type `{msg_type}`: {source}")]
    ParseError {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("wire frame too short or malformed")]
    WireTooShort,
    #[error("unknown channel tag in wire frame")]
    UnknownChannel,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
