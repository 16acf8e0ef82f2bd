//! The two WebSocket wire protocols the bridge speaks to browser clients
//! (§4.5 WebSocket Bridge): the v1 binary frame format
//! (`v1.kernel.websocket.jupyter.org`) and the legacy JSON-plus-sideband-blob
//! format. Both operate purely on bytes and a [`JupyterMessage`]'s four JSON
//! parts plus its `buffers`; neither crosses the ZMQ boundary.

use serde_json::Value;

use crate::channel::Channel;
use crate::error::{ProtocolError, Result};
use crate::messaging::{Header, JupyterMessage};

/// The subprotocol strings a client may request, in the bridge's selection
/// preference order (§4.5 Connect/disconnect).
pub const V1_SUBPROTOCOL: &str = "v1.kernel.websocket.jupyter.org";

/// Chooses a subprotocol from what the client offered: v1 first, else the
/// legacy (unnamed) protocol. Returns `None` only if neither is acceptable,
/// which never happens today since legacy is always available.
pub fn select_subprotocol(offered: &[String]) -> Option<&'static str> {
    if offered.iter().any(|p| p == V1_SUBPROTOCOL) {
        Some(V1_SUBPROTOCOL)
    } else {
        None
    }
}

/// Packs a message's four JSON parts, in the fixed header/parent_header/
/// metadata/content order the v1 layout prescribes.
fn json_parts(message: &JupyterMessage) -> Result<[Vec<u8>; 4]> {
    let parent = match &message.parent_header {
        Some(h) => serde_json::to_vec(h)?,
        None => b"{}".to_vec(),
    };
    Ok([
        serde_json::to_vec(&message.header)?,
        parent,
        serde_json::to_vec(&message.metadata)?,
        serde_json::to_vec(&message.content)?,
    ])
}

/// Encodes one message as a v1 binary frame (§4.5 v1 binary).
///
/// Layout: an 8-byte little-endian offset count, that many 8-byte
/// little-endian offsets (the first points at the channel name, the rest at
/// each following part), then the channel name followed by the parts
/// themselves back to back.
pub fn encode_v1(message: &JupyterMessage, channel: Channel) -> Result<Vec<u8>> {
    let json = json_parts(message)?;
    let channel_bytes = channel.as_str().as_bytes();

    let mut parts: Vec<&[u8]> = Vec::with_capacity(5 + message.buffers.len());
    parts.push(channel_bytes);
    for part in &json {
        parts.push(part.as_slice());
    }
    for buf in &message.buffers {
        parts.push(buf.as_ref());
    }

    // `offsets` holds one boundary per segment (channel, then each JSON/
    // buffer part) plus a final end-of-frame sentinel, so its length is
    // `parts.len() + 1`. The count field plus the offsets array together
    // form the header that `offsets[0]` (the channel's start) points past.
    let offset_count = parts.len() + 1;
    let header_len = 8 + 8 * offset_count;
    let mut offsets = Vec::with_capacity(offset_count);
    let mut running = header_len;
    offsets.push(running);
    for part in &parts {
        running += part.len();
        offsets.push(running);
    }

    let mut out = Vec::with_capacity(running);
    out.extend_from_slice(&(offset_count as u64).to_le_bytes());
    for offset in &offsets {
        out.extend_from_slice(&(*offset as u64).to_le_bytes());
    }
    for part in &parts {
        out.extend_from_slice(part);
    }
    Ok(out)
}

/// Decodes a v1 binary frame back into a channel tag and a [`JupyterMessage`]
/// (§4.5 v1 binary; §8 round-trip invariant).
pub fn decode_v1(frame: &[u8]) -> Result<(Channel, JupyterMessage)> {
    if frame.len() < 8 {
        return Err(ProtocolError::WireTooShort);
    }
    let offset_count = u64::from_le_bytes(frame[0..8].try_into().unwrap()) as usize;
    if offset_count == 0 {
        return Err(ProtocolError::WireTooShort);
    }
    let header_len = 8 + 8 * offset_count;
    if frame.len() < header_len {
        return Err(ProtocolError::WireTooShort);
    }

    let mut offsets = Vec::with_capacity(offset_count);
    for i in 0..offset_count {
        let start = 8 * (i + 1);
        offsets.push(u64::from_le_bytes(frame[start..start + 8].try_into().unwrap()) as usize);
    }

    // `offsets` has one boundary per segment plus a trailing end-of-frame
    // sentinel, so there are `offset_count - 1` segments (channel + parts).
    if offset_count < 2 {
        return Err(ProtocolError::WireTooShort);
    }
    let segment_count = offset_count - 1;
    let mut parts = Vec::with_capacity(segment_count);
    for i in 0..segment_count {
        let (start, end) = (offsets[i], offsets[i + 1]);
        if end < start || end > frame.len() {
            return Err(ProtocolError::WireTooShort);
        }
        parts.push(&frame[start..end]);
    }

    let channel = Channel::from_str(
        std::str::from_utf8(parts[0]).map_err(|_| ProtocolError::WireTooShort)?,
    )
    .ok_or(ProtocolError::UnknownChannel)?;

    if parts.len() < 5 {
        return Err(ProtocolError::WireTooShort);
    }
    let header: Header = serde_json::from_slice(parts[1])?;
    let parent_header: Option<Header> = serde_json::from_slice(parts[2]).ok();
    let metadata: Value = serde_json::from_slice(parts[3])?;
    let content: Value = serde_json::from_slice(parts[4])?;
    let buffers = parts[5..].iter().map(|b| bytes::Bytes::copy_from_slice(b)).collect();

    Ok((
        channel,
        JupyterMessage {
            zmq_identities: Vec::new(),
            header,
            parent_header,
            metadata,
            content,
            buffers,
            channel: Some(channel),
        },
    ))
}

/// The legacy protocol's JSON text-frame shape: the full message dict with a
/// `channel` field, `buffers` omitted (they travel as a separate binary
/// frame per §4.5 legacy).
#[derive(serde::Serialize, serde::Deserialize)]
struct LegacyEnvelope {
    header: Header,
    #[serde(default)]
    parent_header: Value,
    #[serde(default)]
    metadata: Value,
    content: Value,
    channel: Channel,
}

/// Encodes a message with no binary buffers as a legacy JSON text frame.
pub fn encode_legacy_text(message: &JupyterMessage, channel: Channel) -> Result<String> {
    let envelope = LegacyEnvelope {
        header: message.header.clone(),
        parent_header: match &message.parent_header {
            Some(h) => serde_json::to_value(h)?,
            None => Value::Object(Default::default()),
        },
        metadata: message.metadata.clone(),
        content: message.content.clone(),
        channel,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decodes a legacy JSON text frame into a channel tag and message.
pub fn decode_legacy_text(text: &str) -> Result<(Channel, JupyterMessage)> {
    let envelope: LegacyEnvelope = serde_json::from_str(text)?;
    let parent_header = match envelope.parent_header {
        Value::Object(ref obj) if obj.is_empty() => None,
        Value::Null => None,
        other => serde_json::from_value(other).ok(),
    };
    Ok((
        envelope.channel,
        JupyterMessage {
            zmq_identities: Vec::new(),
            header: envelope.header,
            parent_header,
            metadata: envelope.metadata,
            content: envelope.content,
            buffers: Vec::new(),
            channel: Some(envelope.channel),
        },
    ))
}

/// Encodes a message's buffers as the legacy binary-blob sideband: a 4-byte
/// big-endian `nbufs`, then `4*nbufs` big-endian offsets to each buffer,
/// followed by the buffers themselves with the JSON envelope as buffer 0
/// (§4.5 legacy).
pub fn encode_legacy_binary(message: &JupyterMessage, channel: Channel) -> Result<Vec<u8>> {
    let envelope = encode_legacy_text(message, channel)?.into_bytes();
    let mut bufs: Vec<&[u8]> = Vec::with_capacity(1 + message.buffers.len());
    bufs.push(&envelope);
    for buf in &message.buffers {
        bufs.push(buf.as_ref());
    }

    let nbufs = bufs.len() as u32;
    let header_len = 4 + 4 * bufs.len();
    let mut offsets = Vec::with_capacity(bufs.len());
    let mut running = header_len as u32;
    for buf in &bufs {
        offsets.push(running);
        running += buf.len() as u32;
    }

    let mut out = Vec::with_capacity(running as usize);
    out.extend_from_slice(&nbufs.to_be_bytes());
    for offset in &offsets {
        out.extend_from_slice(&offset.to_be_bytes());
    }
    for buf in &bufs {
        out.extend_from_slice(buf);
    }
    Ok(out)
}

/// Decodes a legacy binary blob: the first buffer is the JSON envelope, the
/// rest are `message.buffers`.
pub fn decode_legacy_binary(blob: &[u8]) -> Result<(Channel, JupyterMessage)> {
    if blob.len() < 4 {
        return Err(ProtocolError::WireTooShort);
    }
    let nbufs = u32::from_be_bytes(blob[0..4].try_into().unwrap()) as usize;
    let header_len = 4 + 4 * nbufs;
    if nbufs == 0 || blob.len() < header_len {
        return Err(ProtocolError::WireTooShort);
    }
    let mut offsets = Vec::with_capacity(nbufs + 1);
    for i in 0..nbufs {
        let start = 4 + 4 * i;
        offsets.push(u32::from_be_bytes(blob[start..start + 4].try_into().unwrap()) as usize);
    }
    offsets.push(blob.len());

    let mut bufs = Vec::with_capacity(nbufs);
    for i in 0..nbufs {
        let (start, end) = (offsets[i], offsets[i + 1]);
        if end < start || end > blob.len() {
            return Err(ProtocolError::WireTooShort);
        }
        bufs.push(&blob[start..end]);
    }

    let text = std::str::from_utf8(bufs[0]).map_err(|_| ProtocolError::WireTooShort)?;
    let (channel, mut message) = decode_legacy_text(text)?;
    message.buffers = bufs[1..].iter().map(|b| bytes::Bytes::copy_from_slice(b)).collect();
    Ok((channel, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample_message(buffers: Vec<Bytes>) -> JupyterMessage {
        let mut msg = JupyterMessage::new(
            "execute_request",
            "session-1",
            serde_json::json!({"code": "1+1"}),
        );
        msg.buffers = buffers;
        msg.channel = Some(Channel::Shell);
        msg
    }

    #[test]
    fn v1_round_trips_channel_and_parts() {
        let message = sample_message(vec![Bytes::from_static(b"binary-data")]);
        let frame = encode_v1(&message, Channel::Shell).unwrap();
        let (channel, decoded) = decode_v1(&frame).unwrap();
        assert_eq!(channel, Channel::Shell);
        assert_eq!(decoded.header.msg_id, message.header.msg_id);
        assert_eq!(decoded.content, message.content);
        assert_eq!(decoded.buffers, message.buffers);
    }

    #[test]
    fn v1_round_trips_with_no_buffers() {
        let message = sample_message(vec![]);
        let frame = encode_v1(&message, Channel::IoPub).unwrap();
        let (channel, decoded) = decode_v1(&frame).unwrap();
        assert_eq!(channel, Channel::IoPub);
        assert!(decoded.buffers.is_empty());
    }

    #[test]
    fn v1_rejects_truncated_frame() {
        assert!(decode_v1(&[1, 2, 3]).is_err());
    }

    #[test]
    fn legacy_text_round_trips() {
        let message = sample_message(vec![]);
        let text = encode_legacy_text(&message, Channel::Control).unwrap();
        let (channel, decoded) = decode_legacy_text(&text).unwrap();
        assert_eq!(channel, Channel::Control);
        assert_eq!(decoded.header.msg_id, message.header.msg_id);
    }

    #[test]
    fn legacy_binary_round_trips_with_buffers() {
        let message = sample_message(vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")]);
        let blob = encode_legacy_binary(&message, Channel::Stdin).unwrap();
        let (channel, decoded) = decode_legacy_binary(&blob).unwrap();
        assert_eq!(channel, Channel::Stdin);
        assert_eq!(decoded.buffers.len(), 2);
        assert_eq!(decoded.buffers[0], message.buffers[0]);
        assert_eq!(decoded.buffers[1], message.buffers[1]);
    }

    #[test]
    fn subprotocol_prefers_v1() {
        let offered = vec![V1_SUBPROTOCOL.to_string(), "legacy".to_string()];
        assert_eq!(select_subprotocol(&offered), Some(V1_SUBPROTOCOL));
    }

    #[test]
    fn subprotocol_falls_back_to_legacy_when_v1_not_offered() {
        let offered = vec!["some.other.protocol".to_string()];
        assert_eq!(select_subprotocol(&offered), None);
    }
}
