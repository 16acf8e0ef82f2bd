pub mod channel;
pub mod connection_info;
pub mod error;
pub mod kernelspec;
pub mod messaging;
pub mod wire;

pub use channel::Channel;
pub use connection_info::{ConnectionInfo, Transport};
pub use error::{ProtocolError, Result};
pub use kernelspec::{InterruptMode, JupyterKernelspec};
pub use messaging::{
    ExecutionState, Header, HelpLink, InterruptReply, InterruptRequest, JupyterMessage,
    KernelInfoReply, KernelInfoRequest, LanguageInfo, ReplyError, ReplyStatus, ShutdownReply,
    ShutdownRequest, Status,
};
pub use wire::{select_subprotocol, V1_SUBPROTOCOL};
