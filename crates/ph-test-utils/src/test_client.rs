//! A wire-level client: frames requests the way an external connector
//! would, correlates responses by `msg_seq`, and surfaces pushes.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use ph_protocol::{
    ClientPacket, DEFAULT_MAX_PACKET_SIZE, ResponsePacket, decode_response, encode_request,
    system::{StageReq, commands},
};

pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    /// Frames read while waiting for a specific correlation (pushes, or
    /// responses to other in-flight requests).
    backlog: VecDeque<ResponsePacket>,
    next_seq: u16,
}

impl TestClient {
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(TestClient {
            stream,
            buf: BytesMut::with_capacity(16 * 1024),
            backlog: VecDeque::new(),
            next_seq: 0,
        })
    }

    fn allocate_seq(&mut self) -> u16 {
        self.next_seq = self.next_seq.wrapping_add(1);
        if self.next_seq == 0 {
            self.next_seq = 1;
        }
        self.next_seq
    }

    /// Send a fire-and-forget frame (`msg_seq` 0).
    pub async fn push(
        &mut self,
        msg_id: &str,
        stage_id: i64,
        payload: Bytes,
    ) -> std::io::Result<()> {
        self.write_frame(msg_id, 0, stage_id, payload).await
    }

    /// Send a request and await the response correlated on its `msg_seq`.
    pub async fn request(
        &mut self,
        msg_id: &str,
        stage_id: i64,
        payload: Bytes,
    ) -> std::io::Result<ResponsePacket> {
        self.request_with_deadline(msg_id, stage_id, payload, Duration::from_secs(10)).await
    }

    /// `request` with a caller-chosen deadline; `Err(TimedOut)` past it.
    pub async fn request_with_deadline(
        &mut self,
        msg_id: &str,
        stage_id: i64,
        payload: Bytes,
        deadline: Duration,
    ) -> std::io::Result<ResponsePacket> {
        let msg_seq = self.allocate_seq();
        self.write_frame(msg_id, msg_seq, stage_id, payload).await?;
        timeout(deadline, self.read_matching(msg_seq))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "request deadline"))?
    }

    /// Join convenience: `JoinStage` with the standard request payload.
    pub async fn join_stage(
        &mut self,
        stage_id: i64,
        stage_type: &str,
        auth: &[u8],
    ) -> std::io::Result<ResponsePacket> {
        let payload = StageReq::new(stage_type, Bytes::copy_from_slice(auth))
            .encode()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        self.request(commands::JOIN_STAGE, stage_id, payload).await
    }

    /// Next frame with `msg_seq == 0` (server push), in arrival order.
    pub async fn recv_push(&mut self, deadline: Duration) -> std::io::Result<ResponsePacket> {
        if let Some(pos) = self.backlog.iter().position(|p| p.msg_seq == 0) {
            return Ok(self.backlog.remove(pos).expect("position checked"));
        }
        timeout(deadline, async {
            loop {
                let frame = self.read_frame().await?;
                if frame.msg_seq == 0 {
                    return Ok(frame);
                }
                self.backlog.push_back(frame);
            }
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "push deadline"))?
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn write_frame(
        &mut self,
        msg_id: &str,
        msg_seq: u16,
        stage_id: i64,
        payload: Bytes,
    ) -> std::io::Result<()> {
        let mut out = BytesMut::new();
        encode_request(
            &ClientPacket { msg_id: msg_id.to_owned(), msg_seq, stage_id, payload },
            &mut out,
        )
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        self.stream.write_all(&out).await
    }

    async fn read_matching(&mut self, msg_seq: u16) -> std::io::Result<ResponsePacket> {
        if let Some(pos) = self.backlog.iter().position(|p| p.msg_seq == msg_seq) {
            return Ok(self.backlog.remove(pos).expect("position checked"));
        }
        loop {
            let frame = self.read_frame().await?;
            if frame.msg_seq == msg_seq {
                return Ok(frame);
            }
            self.backlog.push_back(frame);
        }
    }

    async fn read_frame(&mut self) -> std::io::Result<ResponsePacket> {
        loop {
            if let Some(frame) = decode_response(&mut self.buf, DEFAULT_MAX_PACKET_SIZE)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?
            {
                return Ok(frame);
            }
            let read = self.stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ));
            }
        }
    }
}
