pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0}")]
    DecodeError(#[from] data_encoding::DecodeError),
    #[error("failed to get {0} directory")]
    DirNotFound(&'static str),
    #[error("empty argv in kernelspec {kernel_name}")]
    EmptyArgv { kernel_name: String },
    #[error("no kernelspec named `{0}` found on the kernel search path")]
    KernelspecNotFound(String),
    #[error("failed to execute `{command}` command")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("insufficient message parts {0}")]
    InsufficientMessageParts(usize),
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error("missing delimiter")]
    MissingDelimiter,
    #[error("missing hmac")]
    MissingHmac,
    #[error("error deserializing content for msg_type `{msg_type}`: {source}")]
    ParseError {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    VerifyError(ring::error::Unspecified),
    #[error("{0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("{0}")]
    ZmqError(#[from] zeromq::ZmqError),
    #[error("{0}")]
    ZmqMessageError(String),
    #[error("timed out closing sockets for kernel {kernel_id}")]
    CloseTimeout { kernel_id: String },
    #[error("kernel {kernel_id} is already running")]
    AlreadyRunning { kernel_id: String },
    #[error("kernel {kernel_id} is not running")]
    NotRunning { kernel_id: String },
    #[error("startup failed for kernel {kernel_id}: {reason}")]
    StartupFailed { kernel_id: String, reason: String },
    #[error("timed out waiting for kernel {kernel_id} to exit")]
    ShutdownTimeout { kernel_id: String },
    #[cfg(unix)]
    #[error("{0}")]
    NixError(#[from] nix::Error),
}
