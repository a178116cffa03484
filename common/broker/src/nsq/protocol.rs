//! nsqd TCP protocol, V2.
//!
//! Commands are newline-terminated text lines, some followed by a
//! `[size:u32][data]` body. nsqd answers with frames laid out as
//! `[size:i32][frame_type:i32][data]`, where size counts the type and data.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::{Message, MessageId};

/// Sent once, right after connecting.
pub const MAGIC_V2: &[u8] = b"  V2";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

const FRAME_TYPE_RESPONSE: i32 = 0;
const FRAME_TYPE_ERROR: i32 = 1;
const FRAME_TYPE_MESSAGE: i32 = 2;

const SIZE_LEN: usize = 4;
const FRAME_TYPE_LEN: usize = 4;
// timestamp, attempts, id
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MessageId::LEN;
/// Larger than nsqd's own limits, anything bigger is a corrupt stream.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes is too short")]
    FrameTooShort(usize),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} bytes limit")]
    FrameTooLarge(usize),
    #[error("unknown frame type {0}")]
    UnknownFrameType(i32),
    #[error("unexpected response from nsqd: {0}")]
    UnexpectedResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Pub { topic: String, body: Bytes },
    Rdy(u32),
    Fin(MessageId),
    Req(MessageId, Duration),
    Touch(MessageId),
    Nop,
    Cls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(Message),
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(body) if body == HEARTBEAT)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NsqCodec;

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < SIZE_LEN {
            return Ok(None);
        }
        let size = usize::try_from(u32::from_be_bytes([src[0], src[1], src[2], src[3]]))
            .unwrap_or(usize::MAX);
        if size < FRAME_TYPE_LEN {
            return Err(ProtocolError::FrameTooShort(size));
        }
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(size));
        }
        if src.len() < SIZE_LEN + size {
            src.reserve(SIZE_LEN + size - src.len());
            return Ok(None);
        }

        src.advance(SIZE_LEN);
        let mut frame = src.split_to(size);
        let frame_type = frame.get_i32();
        let data = frame.freeze();

        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(data))),
            FRAME_TYPE_ERROR => Ok(Some(Frame::Error(data))),
            FRAME_TYPE_MESSAGE => decode_message(data).map(|m| Some(Frame::Message(m))),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

fn decode_message(mut data: Bytes) -> Result<Message, ProtocolError> {
    if data.len() < MESSAGE_HEADER_LEN {
        return Err(ProtocolError::FrameTooShort(data.len() + FRAME_TYPE_LEN));
    }
    let timestamp = data.get_i64();
    let attempts = data.get_u16();
    let id = data.split_to(MessageId::LEN);
    let id = MessageId::try_from(id.as_ref())
        .map_err(|_| ProtocolError::FrameTooShort(MESSAGE_HEADER_LEN))?;

    Ok(Message::new(id, attempts, timestamp, data))
}

impl Encoder<Command> for NsqCodec {
    type Error = ProtocolError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match command {
            Command::Identify(body) => {
                dst.put_slice(b"IDENTIFY\n");
                put_body(&body, dst)?;
            }
            Command::Sub { topic, channel } => {
                dst.put_slice(format!("SUB {topic} {channel}\n").as_bytes());
            }
            Command::Pub { topic, body } => {
                dst.put_slice(format!("PUB {topic}\n").as_bytes());
                put_body(&body, dst)?;
            }
            Command::Rdy(count) => dst.put_slice(format!("RDY {count}\n").as_bytes()),
            Command::Fin(id) => put_id_command(b"FIN ", id, b"\n", dst),
            Command::Req(id, delay) => {
                let suffix = format!(" {}\n", delay.as_millis());
                put_id_command(b"REQ ", id, suffix.as_bytes(), dst);
            }
            Command::Touch(id) => put_id_command(b"TOUCH ", id, b"\n", dst),
            Command::Nop => dst.put_slice(b"NOP\n"),
            Command::Cls => dst.put_slice(b"CLS\n"),
        }
        Ok(())
    }
}

fn put_body(body: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    let size = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge(body.len()))?;
    dst.reserve(SIZE_LEN + body.len());
    dst.put_u32(size);
    dst.put_slice(body);
    Ok(())
}

fn put_id_command(name: &[u8], id: MessageId, suffix: &[u8], dst: &mut BytesMut) {
    dst.reserve(name.len() + MessageId::LEN + suffix.len());
    dst.put_slice(name);
    dst.put_slice(id.as_bytes());
    dst.put_slice(suffix);
}

/// Wire form of a frame, as nsqd writes it.
#[cfg(test)]
pub(crate) fn encode_frame(frame_type: i32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SIZE_LEN + FRAME_TYPE_LEN + data.len());
    let size = u32::try_from(FRAME_TYPE_LEN + data.len()).expect("test frame fits");
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(&frame_type.to_be_bytes());
    buf.extend_from_slice(data);
    buf
}
