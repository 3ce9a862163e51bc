//! System command names and their fixed payload codecs.
//!
//! System commands are framework-owned messages, so their payloads get tiny
//! hand-rolled codecs here instead of going through the content payload
//! hook. Same little-endian conventions as the frame codecs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

/// System command `msg_id` values recognized by the play dispatcher.
pub mod commands {
    pub const CREATE_STAGE: &str = "CreateStage";
    pub const GET_OR_CREATE_STAGE: &str = "GetOrCreateStage";
    pub const JOIN_STAGE: &str = "JoinStage";
    pub const CREATE_JOIN_STAGE: &str = "CreateJoinStage";
    pub const DISCONNECT_NOTICE: &str = "DisconnectNotice";
    pub const RECONNECT: &str = "Reconnect";
    pub const DESTROY_STAGE: &str = "DestroyStage";

    /// True when `msg_id` is one of the commands above.
    pub fn is_system(msg_id: &str) -> bool {
        matches!(
            msg_id,
            CREATE_STAGE
                | GET_OR_CREATE_STAGE
                | JOIN_STAGE
                | CREATE_JOIN_STAGE
                | DISCONNECT_NOTICE
                | RECONNECT
                | DESTROY_STAGE
        )
    }
}

// ---------------------------------------------------------------------------
// StageReq: CreateStage / JoinStage / CreateJoinStage request payload
// ---------------------------------------------------------------------------

/// Request payload for the stage lifecycle commands: the content factory
/// selector plus opaque bytes. `body` carries the create payload
/// (`CreateStage`) or the auth packet (`JoinStage`); `CreateJoinStage` uses
/// `body` for auth and `extra` for the create payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReq {
    pub stage_type: String,
    pub body: Bytes,
    pub extra: Bytes,
}

impl StageReq {
    pub fn new(stage_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        StageReq { stage_type: stage_type.into(), body: body.into(), extra: Bytes::new() }
    }

    pub fn with_extra(
        stage_type: impl Into<String>,
        body: impl Into<Bytes>,
        extra: impl Into<Bytes>,
    ) -> Self {
        StageReq { stage_type: stage_type.into(), body: body.into(), extra: extra.into() }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let len = self.stage_type.len();
        if len == 0 || len > 255 {
            return Err(WireError::BadMsgIdLength(len));
        }
        let mut buf =
            BytesMut::with_capacity(1 + len + 4 + self.body.len() + self.extra.len());
        buf.put_u8(len as u8);
        buf.put_slice(self.stage_type.as_bytes());
        buf.put_u32_le(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf.put_slice(&self.extra);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> Result<StageReq, WireError> {
        if payload.is_empty() {
            return Err(WireError::Truncated { need: 1, have: 0 });
        }
        let mut buf = payload;
        let len = buf.get_u8() as usize;
        if len == 0 {
            return Err(WireError::BadMsgIdLength(0));
        }
        if buf.remaining() < len + 4 {
            return Err(WireError::Truncated { need: len + 4, have: buf.remaining() });
        }
        let stage_type = std::str::from_utf8(&buf[..len])
            .map_err(|_| WireError::MsgIdNotUtf8)?
            .to_owned();
        buf.advance(len);
        let body_len = buf.get_u32_le() as usize;
        if buf.remaining() < body_len {
            return Err(WireError::Truncated { need: body_len, have: buf.remaining() });
        }
        let body = Bytes::copy_from_slice(&buf[..body_len]);
        buf.advance(body_len);
        Ok(StageReq { stage_type, body, extra: Bytes::copy_from_slice(buf) })
    }
}

// ---------------------------------------------------------------------------
// StageRes: reply payload for the stage lifecycle commands
// ---------------------------------------------------------------------------

/// Success payload for stage lifecycle replies: the server-chosen stage id
/// and whether this call created the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRes {
    pub stage_id: i64,
    pub is_created: bool,
}

impl StageRes {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_i64_le(self.stage_id);
        buf.put_u8(u8::from(self.is_created));
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<StageRes, WireError> {
        if payload.len() < 9 {
            return Err(WireError::Truncated { need: 9, have: payload.len() });
        }
        let mut buf = payload;
        let stage_id = buf.get_i64_le();
        let is_created = buf.get_u8() != 0;
        Ok(StageRes { stage_id, is_created })
    }
}
