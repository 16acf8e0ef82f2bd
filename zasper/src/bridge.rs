//! The WebSocket Bridge (§4.5): translates between one client WebSocket and
//! a kernel's shell/control/stdin/iopub ZMQ sockets. Heartbeat is never
//! forwarded -- it stays an internal liveness probe between the restarter
//! and the kernel.
//!
//! Per-channel order is preserved because each channel gets its own reader
//! task reading one socket in a loop; channels race each other the way the
//! spec allows, but within a channel frames are never reordered.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use zasper_protocol::{Channel, JupyterMessage};
use zasper_runtime::ChannelSocket;

use crate::runtime::Runtime;

pub fn router() -> Router<Arc<Runtime>> {
    Router::new().route("/api/kernels/:id/channels", get(ws_handler))
}

#[derive(Deserialize)]
struct ConnectParams {
    #[serde(default)]
    session_id: String,
}

fn offered_subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(axum::http::header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(',').map(|p| p.trim().to_string()))
        .filter(|p| !p.is_empty())
        .collect()
}

async fn ws_handler(
    State(runtime): State<Arc<Runtime>>,
    Path(kernel_id): Path<String>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> crate::error::Result<Response> {
    // 404s here rather than inside the upgraded socket, so a bad kernel id
    // gets a normal HTTP error instead of a silently closed connection.
    runtime.mkm.get_model(&kernel_id).await?;

    let offered = offered_subprotocols(&headers);
    let selected = zasper_protocol::select_subprotocol(&offered);
    let ws = match selected {
        Some(proto) => ws.protocols([proto]),
        None => ws,
    };
    let is_v1 = selected.is_some();

    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, runtime, kernel_id, params.session_id, is_v1)
    }))
}

/// One inbound client-facing channel's live connection, selected out of
/// [`ChannelSocket`] so the read/write loop below can hold it directly
/// instead of matching on the enum every time.
enum InboundSocket {
    Shell(zasper_runtime::ClientShellConnection),
    Control(zasper_runtime::ClientControlConnection),
    Stdin(zasper_runtime::ClientStdinConnection),
}

fn split_channel_socket(socket: ChannelSocket) -> Option<InboundSocket> {
    match socket {
        ChannelSocket::Shell(c) => Some(InboundSocket::Shell(c)),
        ChannelSocket::Control(c) => Some(InboundSocket::Control(c)),
        ChannelSocket::Stdin(c) => Some(InboundSocket::Stdin(c)),
        ChannelSocket::IoPub(_) | ChannelSocket::Heartbeat(_) => None,
    }
}

async fn handle_socket(
    socket: WebSocket,
    runtime: Arc<Runtime>,
    kernel_id: String,
    session_id: String,
    is_v1: bool,
) {
    let session_key = format!("{kernel_id}:{session_id}");
    let timeout = runtime.settings.kernel_info_timeout;

    if let Err(e) = runtime.mkm.wait_until_alive(&kernel_id, timeout).await {
        log::warn!("kernel {kernel_id} websocket open failed: {e}");
        let (mut sender, _) = socket.split();
        let _ = sender
            .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                code: 1011,
                reason: "timed out waiting for kernel".into(),
            })))
            .await;
        return;
    }

    let reclaimed = runtime.mkm.get_buffer(&kernel_id, &session_key).await.ok().flatten();

    let mut sockets: HashMap<Channel, InboundSocket> = HashMap::new();
    let mut iopub = None;
    let mut replay = Vec::new();

    if let Some((frames, live_sockets)) = reclaimed {
        replay = frames;
        for (channel, socket) in live_sockets {
            if channel == Channel::IoPub {
                if let ChannelSocket::IoPub(c) = socket {
                    iopub = Some(c);
                }
            } else if let Some(inbound) = split_channel_socket(socket) {
                sockets.insert(channel, inbound);
            }
        }
    }

    for channel in [Channel::Shell, Channel::Control, Channel::Stdin] {
        if sockets.contains_key(&channel) {
            continue;
        }
        match runtime.mkm.connect_channel(&kernel_id, channel).await {
            Ok(socket) => {
                if let Some(inbound) = split_channel_socket(socket) {
                    sockets.insert(channel, inbound);
                }
            }
            Err(e) => {
                log::warn!("kernel {kernel_id} failed to open {channel} channel: {e}");
                return;
            }
        }
    }
    if iopub.is_none() {
        match runtime.mkm.connect_channel(&kernel_id, Channel::IoPub).await {
            Ok(ChannelSocket::IoPub(c)) => iopub = Some(c),
            Ok(_) => unreachable!("connect_channel(IoPub) always returns IoPub"),
            Err(e) => {
                log::warn!("kernel {kernel_id} failed to open iopub channel: {e}");
                return;
            }
        }
    }
    let iopub = iopub.expect("iopub socket opened above");

    let _ = runtime.mkm.notify_connect(&kernel_id);

    let (ws_sink, mut ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<WsMessage>(256);
    let (stop_tx, stop_rx) = watch::channel(false);

    let writer = tokio::spawn(run_writer(ws_sink, out_rx));

    for frame in replay {
        let _ = out_tx
            .send(encode_outbound(&frame.message, frame.channel, is_v1, runtime.settings.allow_tracebacks))
            .await;
    }

    send_kernel_info_request(&mut sockets, &kernel_id, &out_tx, is_v1, runtime.settings.allow_tracebacks).await;

    let mut inbound_txs: HashMap<Channel, mpsc::Sender<JupyterMessage>> = HashMap::new();
    let mut readers = Vec::new();
    for (channel, socket) in sockets {
        let (in_tx, in_rx) = mpsc::channel::<JupyterMessage>(64);
        inbound_txs.insert(channel, in_tx);
        readers.push(tokio::spawn(run_duplex_channel(
            channel,
            socket,
            out_tx.clone(),
            in_rx,
            stop_rx.clone(),
            is_v1,
            runtime.settings.allow_tracebacks,
        )));
    }
    let iopub_reader = tokio::spawn(run_iopub_channel(
        iopub,
        out_tx.clone(),
        stop_rx.clone(),
        is_v1,
        runtime.settings.allow_tracebacks,
    ));
    drop(out_tx);

    while let Some(Ok(message)) = ws_stream.next().await {
        let decoded = match decode_inbound(&message, is_v1) {
            Some(d) => d,
            None => continue,
        };
        let Ok((channel, jupyter_message)) = decoded else {
            log::warn!("kernel {kernel_id} dropped a malformed inbound frame");
            continue;
        };
        if channel == Channel::IoPub || channel == Channel::Heartbeat {
            log::warn!("kernel {kernel_id} client tried to send on {channel}, dropping");
            continue;
        }
        if !runtime.settings.msg_type_allowed(&jupyter_message.header.msg_type) {
            log::warn!(
                "kernel {kernel_id} dropped disallowed msg_type `{}`",
                jupyter_message.header.msg_type
            );
            continue;
        }
        if let Some(tx) = inbound_txs.get(&channel) {
            let _ = tx.send(jupyter_message).await;
        }
    }

    let _ = stop_tx.send(true);
    drop(inbound_txs);

    let mut live_sockets = Vec::new();
    for reader in readers {
        if let Ok((channel, socket)) = reader.await {
            live_sockets.push((channel, socket));
        }
    }
    if let Ok(socket) = iopub_reader.await {
        live_sockets.push((Channel::IoPub, ChannelSocket::IoPub(socket)));
    }
    writer.abort();

    let remaining = runtime.mkm.notify_disconnect(&kernel_id).unwrap_or(0);
    if remaining == 0 {
        if let Err(e) = runtime.mkm.start_buffering(&kernel_id, session_key, live_sockets).await {
            log::warn!("kernel {kernel_id} failed to start offline buffering: {e}");
        }
    } else {
        let _ = runtime.mkm.stop_buffering(&kernel_id).await;
    }
}

/// §4.5 Connect: "send a `kernel_info_request` and relay the reply so
/// clients can discover protocol features." Sent on shell right after the
/// channels are open, ahead of the per-channel duplex loops so the reply is
/// read before anything else races it on the socket.
async fn send_kernel_info_request(
    sockets: &mut HashMap<Channel, InboundSocket>,
    kernel_id: &str,
    out_tx: &mpsc::Sender<WsMessage>,
    is_v1: bool,
    allow_tracebacks: bool,
) {
    let Some(InboundSocket::Shell(shell)) = sockets.get_mut(&Channel::Shell) else {
        log::warn!("kernel {kernel_id} has no shell channel open for kernel_info_request");
        return;
    };
    let request = JupyterMessage::new(
        "kernel_info_request",
        kernel_id.to_string(),
        serde_json::to_value(zasper_protocol::KernelInfoRequest {}).unwrap_or(Value::Null),
    );
    if let Err(e) = shell.send(request).await {
        log::warn!("kernel {kernel_id} failed to send kernel_info_request: {e}");
        return;
    }
    match shell.read().await {
        Ok(reply) => {
            let frame = encode_outbound(&reply, Channel::Shell, is_v1, allow_tracebacks);
            let _ = out_tx.send(frame).await;
        }
        Err(e) => log::warn!("kernel {kernel_id} kernel_info_reply failed: {e}"),
    }
}

async fn run_writer(
    mut sink: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<WsMessage>,
) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

fn encode_outbound(message: &JupyterMessage, channel: Channel, is_v1: bool, allow_tracebacks: bool) -> WsMessage {
    let mut message = message.clone();
    if !allow_tracebacks {
        redact_traceback(&mut message);
    }
    if is_v1 {
        match zasper_protocol::wire::encode_v1(&message, channel) {
            Ok(bytes) => WsMessage::Binary(bytes),
            Err(e) => {
                log::warn!("failed to encode v1 frame: {e}");
                WsMessage::Close(None)
            }
        }
    } else if message.buffers.is_empty() {
        match zasper_protocol::wire::encode_legacy_text(&message, channel) {
            Ok(text) => WsMessage::Text(text),
            Err(e) => {
                log::warn!("failed to encode legacy frame: {e}");
                WsMessage::Close(None)
            }
        }
    } else {
        match zasper_protocol::wire::encode_legacy_binary(&message, channel) {
            Ok(bytes) => WsMessage::Binary(bytes),
            Err(e) => {
                log::warn!("failed to encode legacy binary frame: {e}");
                WsMessage::Close(None)
            }
        }
    }
}

fn decode_inbound(message: &WsMessage, is_v1: bool) -> Option<zasper_protocol::Result<(Channel, JupyterMessage)>> {
    match message {
        WsMessage::Binary(bytes) if is_v1 => Some(zasper_protocol::wire::decode_v1(bytes)),
        WsMessage::Binary(bytes) => Some(zasper_protocol::wire::decode_legacy_binary(bytes)),
        WsMessage::Text(text) => Some(zasper_protocol::wire::decode_legacy_text(text)),
        WsMessage::Close(_) | WsMessage::Ping(_) | WsMessage::Pong(_) => None,
    }
}

/// §4.5 `allow_tracebacks`: when off, strips `traceback` from error content,
/// keeping `ename`/`evalue` so the client still knows what failed.
fn redact_traceback(message: &mut JupyterMessage) {
    let is_error = message.header.msg_type == "error"
        || message
            .content
            .as_object()
            .and_then(|o| o.get("status"))
            .and_then(Value::as_str)
            == Some("error");
    if !is_error {
        return;
    }
    if let Some(obj) = message.content.as_object_mut() {
        if obj.contains_key("traceback") {
            obj.insert(
                "traceback".to_string(),
                serde_json::json!(["traceback suppressed"]),
            );
        }
    }
}

/// Drives one of shell/control/stdin: forwards kernel replies out to the
/// client and client requests in to the kernel, until told to stop. Returns
/// the socket so it can feed the offline buffer on disconnect.
#[allow(clippy::too_many_arguments)]
async fn run_duplex_channel(
    channel: Channel,
    socket: InboundSocket,
    out_tx: mpsc::Sender<WsMessage>,
    mut in_rx: mpsc::Receiver<JupyterMessage>,
    mut stop_rx: watch::Receiver<bool>,
    is_v1: bool,
    allow_tracebacks: bool,
) -> (Channel, ChannelSocket) {
    macro_rules! run {
        ($variant:ident, $conn:ident) => {{
            let mut conn = $conn;
            loop {
                tokio::select! {
                    read_result = conn.read() => match read_result {
                        Ok(message) => {
                            let frame = encode_outbound(&message, channel, is_v1, allow_tracebacks);
                            if out_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::debug!("kernel {channel} channel closed: {e}");
                            break;
                        }
                    },
                    inbound = in_rx.recv() => match inbound {
                        Some(message) => {
                            if let Err(e) = conn.send(message).await {
                                log::warn!("failed to forward message on {channel}: {e}");
                            }
                        }
                        None => break,
                    },
                    _ = stop_rx.changed() => break,
                }
            }
            (channel, ChannelSocket::$variant(conn))
        }};
    }

    match socket {
        InboundSocket::Shell(conn) => run!(Shell, conn),
        InboundSocket::Control(conn) => run!(Control, conn),
        InboundSocket::Stdin(conn) => run!(Stdin, conn),
    }
}

/// Forwards IOPub broadcasts to the client; never accepts inbound traffic.
async fn run_iopub_channel(
    mut conn: zasper_runtime::ClientIoPubConnection,
    out_tx: mpsc::Sender<WsMessage>,
    mut stop_rx: watch::Receiver<bool>,
    is_v1: bool,
    allow_tracebacks: bool,
) -> zasper_runtime::ClientIoPubConnection {
    loop {
        tokio::select! {
            read_result = conn.read() => match read_result {
                Ok(message) => {
                    let frame = encode_outbound(&message, Channel::IoPub, is_v1, allow_tracebacks);
                    if out_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("kernel iopub channel closed: {e}");
                    break;
                }
            },
            _ = stop_rx.changed() => break,
        }
    }
    conn
}
