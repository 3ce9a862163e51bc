//! Mesh route packets.
//!
//! A route packet is a client-packet body plus the routing header that lets
//! nodes forward it: originator `nid`, service id, the bound account (0 when
//! unbound), and the session id needed to address a reply back to the
//! originating client connection. Route frames are always length-prefixed —
//! the mesh pipe is raw TCP.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{ClientPacket, ResponsePacket, WireError, take_frame, take_msg_id};

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Route header flag bits.
pub mod flags {
    /// The packet answers a pending request; match `msg_seq` against the
    /// receiver's request cache instead of dispatching.
    pub const REPLY: u8 = 0b0000_0001;
    /// Deliver to the local session `sid` as a client response frame.
    pub const TO_CLIENT: u8 = 0b0000_0010;
    /// Framework-level message (system command or inter-node signal).
    pub const SYSTEM: u8 = 0b0000_0100;
}

// ---------------------------------------------------------------------------
// RouteHeader
// ---------------------------------------------------------------------------

/// Routing metadata carried ahead of the message body on mesh frames.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteHeader {
    /// Originator node id (wire-short form).
    pub from_nid: String,
    pub service_id: u16,
    /// Numeric account binding; 0 when the packet is not bound to an actor.
    pub account_id: i64,
    /// Session id on the node that owns the originating client connection.
    pub sid: i64,
    pub stage_id: i64,
    pub msg_seq: u16,
    pub error_code: u16,
    pub flags: u8,
}

impl RouteHeader {
    pub fn is_reply(&self) -> bool {
        self.flags & flags::REPLY != 0
    }

    pub fn is_to_client(&self) -> bool {
        self.flags & flags::TO_CLIENT != 0
    }

    pub fn is_system(&self) -> bool {
        self.flags & flags::SYSTEM != 0
    }

    pub fn is_request(&self) -> bool {
        self.msg_seq != crate::PUSH_SEQ && !self.is_reply()
    }
}

// ---------------------------------------------------------------------------
// RoutePacket
// ---------------------------------------------------------------------------

/// A message traversing the server mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePacket {
    pub header: RouteHeader,
    pub msg_id: String,
    pub payload: Bytes,
}

impl RoutePacket {
    /// Wrap a client frame received on a local session into a route packet.
    pub fn from_client(pkt: ClientPacket, from_nid: &str, service_id: u16, sid: i64) -> Self {
        RoutePacket {
            header: RouteHeader {
                from_nid: from_nid.to_owned(),
                service_id,
                account_id: 0,
                sid,
                stage_id: pkt.stage_id,
                msg_seq: pkt.msg_seq,
                error_code: 0,
                flags: 0,
            },
            msg_id: pkt.msg_id,
            payload: pkt.payload,
        }
    }

    /// Build the reply to this packet, echoing the correlation fields and
    /// flipping the reply flag.
    pub fn to_reply(&self, from_nid: &str, error_code: u16, payload: Bytes) -> RoutePacket {
        RoutePacket {
            header: RouteHeader {
                from_nid: from_nid.to_owned(),
                service_id: self.header.service_id,
                account_id: self.header.account_id,
                sid: self.header.sid,
                stage_id: self.header.stage_id,
                msg_seq: self.header.msg_seq,
                error_code,
                flags: flags::REPLY,
            },
            msg_id: self.msg_id.clone(),
            payload,
        }
    }

    /// View this packet as the client response frame it carries
    /// (for `TO_CLIENT` deliveries).
    pub fn into_response(self) -> ResponsePacket {
        ResponsePacket {
            msg_id: self.msg_id,
            msg_seq: self.header.msg_seq,
            stage_id: self.header.stage_id,
            error_code: self.header.error_code,
            original_size: 0,
            payload: self.payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

// Fixed header bytes after from_nid: service_id(2) + account_id(8) + sid(8)
// + stage_id(8) + msg_seq(2) + error_code(2).
const ROUTE_FIXED: usize = 2 + 8 + 8 + 8 + 2 + 2;

/// Encode a route frame with its length prefix into `dst`.
pub fn encode_route(pkt: &RoutePacket, dst: &mut BytesMut) -> Result<(), WireError> {
    let from_len = pkt.header.from_nid.len();
    if from_len == 0 || from_len > 255 {
        return Err(WireError::BadMsgIdLength(from_len));
    }
    let id_len = pkt.msg_id.len();
    if id_len == 0 || id_len > 255 {
        return Err(WireError::BadMsgIdLength(id_len));
    }
    let total = 1 + 1 + from_len + ROUTE_FIXED + 1 + id_len + pkt.payload.len();
    let content_size =
        u32::try_from(total).map_err(|_| WireError::PayloadTooLarge(pkt.payload.len()))?;

    dst.reserve(4 + total);
    dst.put_u32_le(content_size);
    dst.put_u8(pkt.header.flags);
    dst.put_u8(from_len as u8);
    dst.put_slice(pkt.header.from_nid.as_bytes());
    dst.put_u16_le(pkt.header.service_id);
    dst.put_i64_le(pkt.header.account_id);
    dst.put_i64_le(pkt.header.sid);
    dst.put_i64_le(pkt.header.stage_id);
    dst.put_u16_le(pkt.header.msg_seq);
    dst.put_u16_le(pkt.header.error_code);
    dst.put_u8(id_len as u8);
    dst.put_slice(pkt.msg_id.as_bytes());
    dst.put_slice(&pkt.payload);
    Ok(())
}

/// Decode one length-prefixed route frame from `src`, if fully buffered.
pub fn decode_route(src: &mut BytesMut, max_packet_size: u32) -> Result<Option<RoutePacket>, WireError> {
    let Some(mut body) = take_frame(src, max_packet_size)? else {
        return Ok(None);
    };
    if body.is_empty() {
        return Err(WireError::Truncated { need: 1, have: 0 });
    }
    let packet_flags = body.get_u8();
    let from_nid = take_msg_id(&mut body, ROUTE_FIXED)?;
    let service_id = body.get_u16_le();
    let account_id = body.get_i64_le();
    let sid = body.get_i64_le();
    let stage_id = body.get_i64_le();
    let msg_seq = body.get_u16_le();
    let error_code = body.get_u16_le();
    let msg_id = take_msg_id(&mut body, 0)?;
    let payload = body.split().freeze();
    Ok(Some(RoutePacket {
        header: RouteHeader {
            from_nid,
            service_id,
            account_id,
            sid,
            stage_id,
            msg_seq,
            error_code,
            flags: packet_flags,
        },
        msg_id,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_MAX_PACKET_SIZE;

    fn sample() -> RoutePacket {
        RoutePacket {
            header: RouteHeader {
                from_nid: "play-1".to_owned(),
                service_id: 5,
                account_id: 42,
                sid: 9001,
                stage_id: 1001,
                msg_seq: 17,
                error_code: 0,
                flags: flags::SYSTEM,
            },
            msg_id: "JoinStage".to_owned(),
            payload: Bytes::from_static(b"auth-bytes"),
        }
    }

    #[test]
    fn route_roundtrip_preserves_header_and_body() {
        let pkt = sample();
        let mut buf = BytesMut::new();
        encode_route(&pkt, &mut buf).expect("encode");
        let got = decode_route(&mut buf, DEFAULT_MAX_PACKET_SIZE)
            .expect("decode")
            .expect("complete");
        assert_eq!(got, pkt);
        assert!(buf.is_empty());
    }

    #[test]
    fn reply_echoes_correlation_and_sets_flag() {
        let pkt = sample();
        let reply = pkt.to_reply("play-2", 0, Bytes::from_static(b"ok"));
        assert!(reply.header.is_reply());
        assert_eq!(reply.header.msg_seq, pkt.header.msg_seq);
        assert_eq!(reply.header.sid, pkt.header.sid);
        assert_eq!(reply.header.from_nid, "play-2");
        assert_eq!(reply.msg_id, pkt.msg_id);
    }

    #[test]
    fn from_client_carries_session_binding() {
        let client = ClientPacket {
            msg_id: "Move".to_owned(),
            msg_seq: 3,
            stage_id: 1001,
            payload: Bytes::from_static(b"p"),
        };
        let routed = RoutePacket::from_client(client, "play-1", 2, 55);
        assert_eq!(routed.header.sid, 55);
        assert_eq!(routed.header.from_nid, "play-1");
        assert_eq!(routed.header.stage_id, 1001);
        assert!(routed.header.is_request());
    }

    #[test]
    fn partial_route_frame_waits_for_more_bytes() {
        let pkt = sample();
        let mut full = BytesMut::new();
        encode_route(&pkt, &mut full).expect("encode");

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..10]);
        assert_eq!(decode_route(&mut partial, DEFAULT_MAX_PACKET_SIZE).expect("ok"), None);
        partial.extend_from_slice(&full[10..]);
        assert!(decode_route(&mut partial, DEFAULT_MAX_PACKET_SIZE).expect("ok").is_some());
    }
}
