// ph-protocol: PlayHouse wire protocol types and codecs.
//
// Two frame families share one body layout:
//
// - Client frames (client <-> play node). TCP carries a `content_size: u32`
//   length prefix; WebSocket messages carry the identical body without the
//   prefix (the WS transport already frames messages).
// - Route frames (node <-> node mesh). The client body plus a route header,
//   always length-prefixed.
//
// All integers are little-endian. `content_size` covers every byte after
// itself. Payloads are opaque `Bytes` views into the receive buffer; the
// decoder never copies payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub mod route;
pub mod system;

pub use route::{RouteHeader, RoutePacket, flags};

/// Default cap on the decoded body size (`max_packet_size` config default).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 2 * 1024 * 1024;

/// `msg_seq` value reserved for fire-and-forget / push messages.
pub const PUSH_SEQ: u16 = 0;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Shared error-code namespace carried in response frames and route replies.
///
/// 0 is success; every non-zero code is a failure. Fire-and-forget failures
/// never reach the client, so these only appear on correlated responses.
pub mod error_codes {
    pub const SUCCESS: u16 = 0;
    pub const AUTHENTICATION_FAILED: u16 = 1;
    pub const STAGE_NOT_FOUND: u16 = 2;
    pub const JOIN_STAGE_REJECTED: u16 = 3;
    pub const INVALID_STAGE_TYPE: u16 = 4;
    pub const INVALID_ACCOUNT_ID: u16 = 5;
    pub const STAGE_ALREADY_EXISTS: u16 = 6;
    pub const CREATE_STAGE_REJECTED: u16 = 7;
    pub const ACTOR_NOT_FOUND: u16 = 8;
    pub const REQUEST_TIMEOUT: u16 = 9;
    pub const CONNECTION_CLOSED: u16 = 10;
    pub const PROTOCOL_VIOLATION: u16 = 11;
    pub const INTERNAL_ERROR: u16 = 12;
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Fatal framing errors. Any of these closes the offending session after the
/// error hook runs; none of them are recoverable mid-stream.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("declared content size {0} exceeds the {1} byte limit")]
    FrameTooLarge(u32, u32),
    #[error("msg_id length must be 1-255 bytes, got {0}")]
    BadMsgIdLength(usize),
    #[error("msg_id is not valid UTF-8")]
    MsgIdNotUtf8,
    #[error("declared fields exceed content size (need {need}, have {have})")]
    Truncated { need: usize, have: usize },
    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),
}

// ---------------------------------------------------------------------------
// Packet abstraction
// ---------------------------------------------------------------------------

/// A logical message: a type name plus opaque payload bytes.
///
/// Content code keeps its own serialization (protobuf, JSON, hand-rolled) and
/// surfaces it through this trait; the core never interprets the payload.
pub trait Packet: Send {
    fn msg_id(&self) -> &str;
    fn payload(&self) -> &[u8];
    /// Owned payload bytes. Implementations holding `Bytes` already should
    /// override this with a refcount bump instead of the default copy.
    fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(self.payload())
    }
}

/// The trivial `Packet`: a name and a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesPacket {
    pub msg_id: String,
    pub payload: Bytes,
}

impl BytesPacket {
    pub fn new(msg_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        BytesPacket { msg_id: msg_id.into(), payload: payload.into() }
    }

    /// A payload-less packet, for signal-style messages.
    pub fn empty(msg_id: impl Into<String>) -> Self {
        BytesPacket { msg_id: msg_id.into(), payload: Bytes::new() }
    }
}

impl Packet for BytesPacket {
    fn msg_id(&self) -> &str {
        &self.msg_id
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn to_payload(&self) -> Bytes {
        self.payload.clone()
    }
}

// ---------------------------------------------------------------------------
// Client request
// ---------------------------------------------------------------------------

/// A decoded client-to-server frame.
///
/// `msg_seq == 0` is a push (no response expected); any other value is a
/// request awaiting a response correlated on the same `msg_seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPacket {
    pub msg_id: String,
    pub msg_seq: u16,
    pub stage_id: i64,
    pub payload: Bytes,
}

impl ClientPacket {
    pub fn is_request(&self) -> bool {
        self.msg_seq != PUSH_SEQ
    }
}

/// A server-to-client frame. `stage_id` echoes the request target, or names
/// the originating stage on unsolicited pushes. `original_size` is 0 when the
/// payload is not compressed, else the uncompressed length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    pub msg_id: String,
    pub msg_seq: u16,
    pub stage_id: i64,
    pub error_code: u16,
    pub original_size: u32,
    pub payload: Bytes,
}

impl ResponsePacket {
    /// A bare error response to a request, with no payload.
    pub fn error(msg_id: impl Into<String>, msg_seq: u16, stage_id: i64, error_code: u16) -> Self {
        ResponsePacket {
            msg_id: msg_id.into(),
            msg_seq,
            stage_id,
            error_code,
            original_size: 0,
            payload: Bytes::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request codec
// ---------------------------------------------------------------------------

// Fixed body bytes after msg_id: msg_seq(2) + stage_id(8).
const REQUEST_FIXED: usize = 2 + 8;
// Fixed body bytes after msg_id: msg_seq(2) + stage_id(8) + error_code(2) + original_size(4).
const RESPONSE_FIXED: usize = 2 + 8 + 2 + 4;

fn check_msg_id(msg_id: &str) -> Result<u8, WireError> {
    let len = msg_id.len();
    if len == 0 || len > 255 {
        return Err(WireError::BadMsgIdLength(len));
    }
    Ok(len as u8)
}

/// Encode a request with its TCP length prefix into `dst`.
pub fn encode_request(pkt: &ClientPacket, dst: &mut BytesMut) -> Result<(), WireError> {
    let id_len = check_msg_id(&pkt.msg_id)?;
    let content_size = content_size_for(id_len, REQUEST_FIXED, pkt.payload.len())?;
    dst.reserve(4 + content_size as usize);
    dst.put_u32_le(content_size);
    encode_request_body(pkt, dst)
}

/// Encode a request body without the length prefix (WebSocket form).
pub fn encode_request_body(pkt: &ClientPacket, dst: &mut BytesMut) -> Result<(), WireError> {
    let id_len = check_msg_id(&pkt.msg_id)?;
    dst.put_u8(id_len);
    dst.put_slice(pkt.msg_id.as_bytes());
    dst.put_u16_le(pkt.msg_seq);
    dst.put_i64_le(pkt.stage_id);
    dst.put_slice(&pkt.payload);
    Ok(())
}

/// Encode a response with its TCP length prefix into `dst`.
pub fn encode_response(pkt: &ResponsePacket, dst: &mut BytesMut) -> Result<(), WireError> {
    let id_len = check_msg_id(&pkt.msg_id)?;
    let content_size = content_size_for(id_len, RESPONSE_FIXED, pkt.payload.len())?;
    dst.reserve(4 + content_size as usize);
    dst.put_u32_le(content_size);
    encode_response_body(pkt, dst)
}

/// Encode a response body without the length prefix (WebSocket form).
pub fn encode_response_body(pkt: &ResponsePacket, dst: &mut BytesMut) -> Result<(), WireError> {
    let id_len = check_msg_id(&pkt.msg_id)?;
    dst.put_u8(id_len);
    dst.put_slice(pkt.msg_id.as_bytes());
    dst.put_u16_le(pkt.msg_seq);
    dst.put_i64_le(pkt.stage_id);
    dst.put_u16_le(pkt.error_code);
    dst.put_u32_le(pkt.original_size);
    dst.put_slice(&pkt.payload);
    Ok(())
}

fn content_size_for(id_len: u8, fixed: usize, payload: usize) -> Result<u32, WireError> {
    let total = 1 + id_len as usize + fixed + payload;
    u32::try_from(total).map_err(|_| WireError::PayloadTooLarge(payload))
}

/// Decode one length-prefixed request from `src`, if a whole frame is
/// buffered. Returns `Ok(None)` when more bytes are needed; consumed bytes
/// are split off `src` only once a full frame is present.
pub fn decode_request(src: &mut BytesMut, max_packet_size: u32) -> Result<Option<ClientPacket>, WireError> {
    let Some(mut body) = take_frame(src, max_packet_size)? else {
        return Ok(None);
    };
    decode_request_body(&mut body).map(Some)
}

/// Decode a request body (no length prefix). `body` must hold exactly one
/// message; trailing bytes are the payload.
pub fn decode_request_body(body: &mut BytesMut) -> Result<ClientPacket, WireError> {
    let msg_id = take_msg_id(body, REQUEST_FIXED)?;
    let msg_seq = body.get_u16_le();
    let stage_id = body.get_i64_le();
    let payload = body.split().freeze();
    Ok(ClientPacket { msg_id, msg_seq, stage_id, payload })
}

/// Decode one length-prefixed response from `src`, if a whole frame is
/// buffered.
pub fn decode_response(src: &mut BytesMut, max_packet_size: u32) -> Result<Option<ResponsePacket>, WireError> {
    let Some(mut body) = take_frame(src, max_packet_size)? else {
        return Ok(None);
    };
    decode_response_body(&mut body).map(Some)
}

/// Decode a response body (no length prefix).
pub fn decode_response_body(body: &mut BytesMut) -> Result<ResponsePacket, WireError> {
    let msg_id = take_msg_id(body, RESPONSE_FIXED)?;
    let msg_seq = body.get_u16_le();
    let stage_id = body.get_i64_le();
    let error_code = body.get_u16_le();
    let original_size = body.get_u32_le();
    let payload = body.split().freeze();
    Ok(ResponsePacket { msg_id, msg_seq, stage_id, error_code, original_size, payload })
}

// ---------------------------------------------------------------------------
// Frame helpers (shared with the route codec)
// ---------------------------------------------------------------------------

/// Split the next length-prefixed frame body off `src`, or `None` if the
/// frame is not fully buffered yet. Oversized declarations fail before any
/// bytes are consumed, so the caller can close the connection cleanly.
pub(crate) fn take_frame(src: &mut BytesMut, max_packet_size: u32) -> Result<Option<BytesMut>, WireError> {
    if src.len() < 4 {
        return Ok(None);
    }
    let content_size = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    if content_size > max_packet_size {
        return Err(WireError::FrameTooLarge(content_size, max_packet_size));
    }
    let frame_len = 4 + content_size as usize;
    if src.len() < frame_len {
        // Make room for the rest of the frame in one reallocation.
        src.reserve(frame_len - src.len());
        return Ok(None);
    }
    src.advance(4);
    Ok(Some(src.split_to(content_size as usize)))
}

/// Read the `msg_id_len | msg_id` prefix, verifying the declared lengths fit
/// the remaining body.
pub(crate) fn take_msg_id(body: &mut BytesMut, fixed_after: usize) -> Result<String, WireError> {
    if body.is_empty() {
        return Err(WireError::Truncated { need: 1, have: 0 });
    }
    let id_len = body.get_u8() as usize;
    if id_len == 0 {
        return Err(WireError::BadMsgIdLength(0));
    }
    let need = id_len + fixed_after;
    if body.len() < need {
        return Err(WireError::Truncated { need, have: body.len() });
    }
    let raw = body.split_to(id_len);
    match std::str::from_utf8(&raw) {
        Ok(s) => Ok(s.to_owned()),
        Err(_) => Err(WireError::MsgIdNotUtf8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(pkt: &ClientPacket) -> ClientPacket {
        let mut buf = BytesMut::new();
        encode_request(pkt, &mut buf).expect("encode");
        decode_request(&mut buf, DEFAULT_MAX_PACKET_SIZE)
            .expect("decode")
            .expect("complete frame")
    }

    #[test]
    fn request_roundtrip_preserves_all_fields() {
        let pkt = ClientPacket {
            msg_id: "Move".to_owned(),
            msg_seq: 7,
            stage_id: 1001,
            payload: Bytes::from_static(b"\x01\x02\x03"),
        };
        assert_eq!(roundtrip_request(&pkt), pkt);
    }

    #[test]
    fn empty_payload_roundtrips() {
        let pkt = ClientPacket {
            msg_id: "Ping".to_owned(),
            msg_seq: 0,
            stage_id: 0,
            payload: Bytes::new(),
        };
        assert_eq!(roundtrip_request(&pkt), pkt);
    }

    #[test]
    fn response_roundtrip_preserves_error_and_original_size() {
        let pkt = ResponsePacket {
            msg_id: "MoveRes".to_owned(),
            msg_seq: 7,
            stage_id: 1001,
            error_code: error_codes::STAGE_NOT_FOUND,
            original_size: 4096,
            payload: Bytes::from_static(b"zz"),
        };
        let mut buf = BytesMut::new();
        encode_response(&pkt, &mut buf).expect("encode");
        let got = decode_response(&mut buf, DEFAULT_MAX_PACKET_SIZE)
            .expect("decode")
            .expect("complete frame");
        assert_eq!(got, pkt);
    }

    #[test]
    fn partial_frame_returns_none_and_keeps_bytes() {
        let pkt = ClientPacket {
            msg_id: "Move".to_owned(),
            msg_seq: 1,
            stage_id: 5,
            payload: Bytes::from_static(b"abcdef"),
        };
        let mut full = BytesMut::new();
        encode_request(&pkt, &mut full).expect("encode");

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..full.len() - 3]);
        assert_eq!(decode_request(&mut partial, DEFAULT_MAX_PACKET_SIZE).expect("ok"), None);

        partial.extend_from_slice(&full[full.len() - 3..]);
        let got = decode_request(&mut partial, DEFAULT_MAX_PACKET_SIZE)
            .expect("ok")
            .expect("now complete");
        assert_eq!(got, pkt);
        assert!(partial.is_empty());
    }

    #[test]
    fn two_pipelined_frames_decode_in_order() {
        let first = ClientPacket {
            msg_id: "A".to_owned(),
            msg_seq: 1,
            stage_id: 1,
            payload: Bytes::from_static(b"1"),
        };
        let second = ClientPacket {
            msg_id: "B".to_owned(),
            msg_seq: 2,
            stage_id: 2,
            payload: Bytes::from_static(b"2"),
        };
        let mut buf = BytesMut::new();
        encode_request(&first, &mut buf).expect("encode");
        encode_request(&second, &mut buf).expect("encode");

        assert_eq!(
            decode_request(&mut buf, DEFAULT_MAX_PACKET_SIZE).expect("ok"),
            Some(first)
        );
        assert_eq!(
            decode_request(&mut buf, DEFAULT_MAX_PACKET_SIZE).expect("ok"),
            Some(second)
        );
        assert_eq!(decode_request(&mut buf, DEFAULT_MAX_PACKET_SIZE).expect("ok"), None);
    }

    #[test]
    fn oversized_declaration_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(DEFAULT_MAX_PACKET_SIZE + 1);
        assert_eq!(
            decode_request(&mut buf, DEFAULT_MAX_PACKET_SIZE),
            Err(WireError::FrameTooLarge(DEFAULT_MAX_PACKET_SIZE + 1, DEFAULT_MAX_PACKET_SIZE))
        );
    }

    #[test]
    fn zero_length_msg_id_is_rejected() {
        let mut buf = BytesMut::new();
        // content_size = 11: msg_id_len(1 byte, value 0) + msg_seq + stage_id.
        buf.put_u32_le(11);
        buf.put_u8(0);
        buf.put_u16_le(1);
        buf.put_i64_le(9);
        assert_eq!(
            decode_request(&mut buf, DEFAULT_MAX_PACKET_SIZE),
            Err(WireError::BadMsgIdLength(0))
        );
    }

    #[test]
    fn declared_msg_id_longer_than_body_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        buf.put_u8(200); // claims a 200-byte msg_id inside a 3-byte body
        buf.put_u16_le(0);
        match decode_request(&mut buf, DEFAULT_MAX_PACKET_SIZE) {
            Err(WireError::Truncated { .. }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn non_utf8_msg_id_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(13);
        buf.put_u8(2);
        buf.put_slice(&[0xff, 0xfe]);
        buf.put_u16_le(0);
        buf.put_i64_le(0);
        assert_eq!(
            decode_request(&mut buf, DEFAULT_MAX_PACKET_SIZE),
            Err(WireError::MsgIdNotUtf8)
        );
    }

    #[test]
    fn encode_rejects_out_of_range_msg_id_lengths() {
        let long = "x".repeat(256);
        let pkt = ClientPacket {
            msg_id: long,
            msg_seq: 1,
            stage_id: 1,
            payload: Bytes::new(),
        };
        let mut buf = BytesMut::new();
        assert_eq!(encode_request(&pkt, &mut buf), Err(WireError::BadMsgIdLength(256)));

        let empty = ClientPacket { msg_id: String::new(), ..pkt };
        assert_eq!(encode_request(&empty, &mut buf), Err(WireError::BadMsgIdLength(0)));
    }

    #[test]
    fn msg_id_boundary_lengths_roundtrip() {
        for len in [1usize, 255] {
            let pkt = ClientPacket {
                msg_id: "m".repeat(len),
                msg_seq: 3,
                stage_id: -1,
                payload: Bytes::from_static(b"p"),
            };
            assert_eq!(roundtrip_request(&pkt), pkt, "len {len}");
        }
    }

    #[test]
    fn websocket_body_roundtrips_without_prefix() {
        let pkt = ClientPacket {
            msg_id: "WsMove".to_owned(),
            msg_seq: 4,
            stage_id: 77,
            payload: Bytes::from_static(b"xyz"),
        };
        let mut body = BytesMut::new();
        encode_request_body(&pkt, &mut body).expect("encode");
        let got = decode_request_body(&mut body).expect("decode");
        assert_eq!(got, pkt);
    }
}
