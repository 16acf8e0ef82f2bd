//! ZeroMQ socket setup and HMAC-signed wire framing (§4.1 Connection Layer).
//!
//! The server always plays the connecting side: kernels bind their five
//! sockets per the connection file they were launched with, and we connect
//! to them as shell=DEALER, iopub=SUB, stdin=DEALER, control=DEALER,
//! hb=REQ.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use data_encoding::HEXLOWER;
use ring::hmac;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use zasper_protocol::{ConnectionInfo, Header, JupyterMessage};
use zeromq::Socket as _;
use zeromq::SocketRecv as _;
use zeromq::SocketSend as _;

use crate::{Result, RuntimeError};

/// Binds `num` ephemeral TCP listeners on `ip` just long enough to read back
/// the ports the OS assigned, then drops them. Used to pre-allocate a
/// connection file's ports before a kernel exists to bind them (§3 Connection
/// Info).
pub async fn peek_ports(ip: IpAddr, num: usize) -> Result<Vec<u16>> {
    let addr = SocketAddr::new(ip, 0);
    let mut ports = Vec::with_capacity(num);
    for _ in 0..num {
        let listener = TcpListener::bind(addr).await?;
        ports.push(listener.local_addr()?.port());
    }
    Ok(ports)
}

pub struct Connection<S> {
    pub socket: S,
    /// `None` when the connection key is empty (signing disabled).
    pub mac: Option<hmac::Key>,
    pub session_id: String,
}

pub type ClientShellConnection = Connection<zeromq::DealerSocket>;
pub type ClientControlConnection = Connection<zeromq::DealerSocket>;
pub type ClientStdinConnection = Connection<zeromq::DealerSocket>;
pub type ClientIoPubConnection = Connection<zeromq::SubSocket>;
pub struct ClientHeartbeatConnection {
    pub socket: zeromq::ReqSocket,
}

impl<S: zeromq::Socket> Connection<S> {
    pub fn new(socket: S, key: &str, session_id: &str) -> Self {
        let mac = if key.is_empty() {
            None
        } else {
            Some(hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes()))
        };
        Connection {
            socket,
            mac,
            session_id: session_id.to_string(),
        }
    }
}

impl<S: zeromq::SocketSend> Connection<S> {
    pub async fn send(&mut self, message: JupyterMessage) -> Result<()> {
        let raw = RawMessage::from_jupyter_message(message)?;
        let zmq_message = raw.into_zmq_message(&self.mac)?;
        self.socket.send(zmq_message).await?;
        Ok(())
    }
}

impl<S: zeromq::SocketRecv> Connection<S> {
    pub async fn read(&mut self) -> Result<JupyterMessage> {
        let raw = RawMessage::from_multipart(self.socket.recv().await?, &self.mac)?;
        raw.into_jupyter_message()
    }
}

impl ClientHeartbeatConnection {
    /// Sends one ping and waits for the kernel's pong. Used by the
    /// restarter's `is_alive` poll (§4.3).
    pub async fn single_heartbeat(&mut self) -> Result<()> {
        self.socket
            .send(zeromq::ZmqMessage::from(b"ping".to_vec()))
            .await?;
        let _pong = self.socket.recv().await?;
        Ok(())
    }
}

pub async fn create_client_iopub_connection(
    connection_info: &ConnectionInfo,
    topic: &str,
    session_id: &str,
) -> Result<ClientIoPubConnection> {
    let mut socket = zeromq::SubSocket::new();
    socket.subscribe(topic).await?;
    socket.connect(&connection_info.iopub_url()).await?;
    Ok(Connection::new(socket, &connection_info.key, session_id))
}

pub async fn create_client_shell_connection(
    connection_info: &ConnectionInfo,
    session_id: &str,
) -> Result<ClientShellConnection> {
    let mut socket = zeromq::DealerSocket::new();
    socket.connect(&connection_info.shell_url()).await?;
    Ok(Connection::new(socket, &connection_info.key, session_id))
}

pub async fn create_client_control_connection(
    connection_info: &ConnectionInfo,
    session_id: &str,
) -> Result<ClientControlConnection> {
    let mut socket = zeromq::DealerSocket::new();
    socket.connect(&connection_info.control_url()).await?;
    Ok(Connection::new(socket, &connection_info.key, session_id))
}

pub async fn create_client_stdin_connection(
    connection_info: &ConnectionInfo,
    session_id: &str,
) -> Result<ClientStdinConnection> {
    let mut socket = zeromq::DealerSocket::new();
    socket.connect(&connection_info.stdin_url()).await?;
    Ok(Connection::new(socket, &connection_info.key, session_id))
}

pub async fn create_client_heartbeat_connection(
    connection_info: &ConnectionInfo,
) -> Result<ClientHeartbeatConnection> {
    let mut socket = zeromq::ReqSocket::new();
    socket.connect(&connection_info.hb_url()).await?;
    Ok(ClientHeartbeatConnection { socket })
}

/// The five live sockets a kernel manager holds open for one kernel.
pub struct KernelSockets {
    pub shell: ClientShellConnection,
    pub control: ClientControlConnection,
    pub stdin: ClientStdinConnection,
    pub iopub: ClientIoPubConnection,
    pub heartbeat: ClientHeartbeatConnection,
}

impl KernelSockets {
    pub async fn connect(connection_info: &ConnectionInfo, session_id: &str) -> Result<Self> {
        Ok(KernelSockets {
            shell: create_client_shell_connection(connection_info, session_id).await?,
            control: create_client_control_connection(connection_info, session_id).await?,
            stdin: create_client_stdin_connection(connection_info, session_id).await?,
            iopub: create_client_iopub_connection(connection_info, "", session_id).await?,
            heartbeat: create_client_heartbeat_connection(connection_info).await?,
        })
    }

    /// Approximates the ~1s finite linger the spec calls for (§4.1) on top
    /// of a `zeromq` crate that has no `SO_LINGER` knob: close every socket
    /// concurrently and bound the whole operation with a timeout instead.
    pub async fn close_with_linger(self, kernel_id: &str, linger: Duration) -> Result<()> {
        let close_all = async {
            let _ = tokio::join!(
                self.shell.socket.close(),
                self.control.socket.close(),
                self.stdin.socket.close(),
                self.iopub.socket.close(),
                self.heartbeat.socket.close(),
            );
        };
        timeout(linger, close_all).await.map_err(|_| RuntimeError::CloseTimeout {
            kernel_id: kernel_id.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct RawMessage {
    pub zmq_identities: Vec<Bytes>,
    pub jparts: Vec<Bytes>,
}

const DELIMITER: &[u8] = b"<IDS|MSG>";

impl RawMessage {
    pub fn from_multipart(
        multipart: zeromq::ZmqMessage,
        key: &Option<hmac::Key>,
    ) -> Result<RawMessage> {
        let delimiter_index = multipart
            .iter()
            .position(|part| &part[..] == DELIMITER)
            .ok_or(RuntimeError::MissingDelimiter)?;
        let mut parts = multipart.into_vec();

        let jparts: Vec<_> = parts.drain(delimiter_index + 2..).collect();
        let expected_hmac = parts.pop().ok_or(RuntimeError::MissingHmac)?;
        parts.pop();
        let zmq_identities = parts;

        let raw_message = RawMessage {
            zmq_identities,
            jparts,
        };

        if let Some(key) = key {
            let sig = HEXLOWER.decode(&expected_hmac)?;
            let mut msg = Vec::new();
            for part in &raw_message.jparts[..4] {
                msg.extend(part);
            }
            hmac::verify(key, msg.as_ref(), sig.as_ref()).map_err(RuntimeError::VerifyError)?;
        }

        Ok(raw_message)
    }

    fn hmac(&self, key: &Option<hmac::Key>) -> String {
        match key {
            Some(key) => {
                let mut ctx = hmac::Context::with_key(key);
                for part in &self.jparts {
                    ctx.update(part);
                }
                HEXLOWER.encode(ctx.sign().as_ref())
            }
            None => String::new(),
        }
    }

    fn into_zmq_message(self, key: &Option<hmac::Key>) -> Result<zeromq::ZmqMessage> {
        let hmac = self.hmac(key);

        let mut parts: Vec<Bytes> = Vec::new();
        for part in &self.zmq_identities {
            parts.push(part.clone());
        }
        parts.push(DELIMITER.into());
        parts.push(hmac.as_bytes().to_vec().into());
        parts.extend(self.jparts);

        zeromq::ZmqMessage::try_from(parts).map_err(|e| RuntimeError::ZmqMessageError(e.to_string()))
    }

    fn from_jupyter_message(message: JupyterMessage) -> Result<RawMessage> {
        let mut jparts: Vec<Bytes> = vec![
            serde_json::to_vec(&message.header)?.into(),
            match message.parent_header.as_ref() {
                Some(parent) => serde_json::to_vec(parent)?.into(),
                None => serde_json::to_vec(&serde_json::Map::new())?.into(),
            },
            serde_json::to_vec(&message.metadata)?.into(),
            serde_json::to_vec(&message.content)?.into(),
        ];
        jparts.extend(message.buffers.clone());
        Ok(RawMessage {
            zmq_identities: message.zmq_identities,
            jparts,
        })
    }

    fn into_jupyter_message(self) -> Result<JupyterMessage> {
        if self.jparts.len() < 4 {
            return Err(RuntimeError::InsufficientMessageParts(self.jparts.len()));
        }

        let header: Header = serde_json::from_slice(&self.jparts[0])?;
        let parent_header = serde_json::from_slice(&self.jparts[1]).ok();
        let metadata: Value = serde_json::from_slice(&self.jparts[2])?;
        let content: Value = serde_json::from_slice(&self.jparts[3])?;

        Ok(JupyterMessage {
            zmq_identities: self.zmq_identities,
            header,
            parent_header,
            metadata,
            content,
            buffers: self.jparts[4..].to_vec(),
            channel: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> JupyterMessage {
        JupyterMessage::new(
            "kernel_info_request",
            "session-1",
            serde_json::json!({}),
        )
    }

    #[test]
    fn round_trips_through_raw_message_without_signing() {
        let msg = sample_message();
        let original_msg_id = msg.header.msg_id.clone();
        let raw = RawMessage::from_jupyter_message(msg).unwrap();
        let zmq_message = raw.into_zmq_message(&None).unwrap();
        let raw_back = RawMessage::from_multipart(zmq_message, &None).unwrap();
        let back = raw_back.into_jupyter_message().unwrap();
        assert_eq!(back.header.msg_id, original_msg_id);
        assert_eq!(back.header.msg_type, "kernel_info_request");
    }

    #[test]
    fn signed_round_trip_verifies_hmac() {
        let key = hmac::Key::new(hmac::HMAC_SHA256, b"secret");
        let msg = sample_message();
        let raw = RawMessage::from_jupyter_message(msg).unwrap();
        let zmq_message = raw.into_zmq_message(&Some(key.clone())).unwrap();
        let raw_back = RawMessage::from_multipart(zmq_message, &Some(key)).unwrap();
        assert!(raw_back.into_jupyter_message().is_ok());
    }

    #[test]
    fn tampered_hmac_is_rejected() {
        let key = hmac::Key::new(hmac::HMAC_SHA256, b"secret");
        let other_key = hmac::Key::new(hmac::HMAC_SHA256, b"not-the-secret");
        let raw = RawMessage::from_jupyter_message(sample_message()).unwrap();
        let zmq_message = raw.into_zmq_message(&Some(key)).unwrap();
        assert!(RawMessage::from_multipart(zmq_message, &Some(other_key)).is_err());
    }

    #[tokio::test]
    async fn peek_ports_returns_distinct_ports() {
        let ports = peek_ports("127.0.0.1".parse().unwrap(), 5).await.unwrap();
        assert_eq!(ports.len(), 5);
        let mut sorted = ports.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ports.len());
    }
}
