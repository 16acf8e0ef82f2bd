pub mod connection;
pub mod connection_file;
pub mod dirs;
pub mod error;
pub mod kernel_manager;
pub mod kernelspec;
pub mod provisioner;
pub mod restarter;

pub use connection::{
    ClientControlConnection, ClientIoPubConnection, ClientShellConnection, ClientStdinConnection,
};
pub use error::{Result, RuntimeError};
pub use kernel_manager::{ChannelSocket, KernelManager, KernelState, RestartObserver, ShutdownStatus};
pub use restarter::{RestartEvent, Restarter, RestarterConfig};
