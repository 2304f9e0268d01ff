//! Wire framing for the worker socket protocol.
//!
//! Messages are multipart: a one-byte frame count followed by each frame as
//! a u32 big-endian length and its bytes. TCP stands in for an identity-
//! addressed DEALER/ROUTER pair, so the connecting side announces its socket
//! identity once, as a preamble, right after the connection opens.
//!
//! Control messages are a single frame holding one marker byte. Requests and
//! responses are exactly 7 frames:
//!
//! ```text
//! [client_identity, empty, marker, bounce_count_ascii, request_id, empty, payload]
//! ```

use std::io::{self, Read, Write};

use crate::error::{Error, Result};

pub const MARKER_READY: u8 = 0x01;
pub const MARKER_HEARTBEAT: u8 = 0x02;
pub const MARKER_SHUTDOWN: u8 = 0x03;
pub const MARKER_REQUEST: u8 = 0x04;
pub const MARKER_RESPONSE: u8 = 0x05;

// Frames larger than this are assumed to be stream corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const MAX_FRAMES: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Response,
}

impl EnvelopeKind {
    fn marker(&self) -> u8 {
        match self {
            Self::Request => MARKER_REQUEST,
            Self::Response => MARKER_RESPONSE,
        }
    }
}

/// A 7-frame request or response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub client: Vec<u8>,
    pub kind: EnvelopeKind,
    pub bounce_count: u64,
    pub request_id: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn request(client: Vec<u8>, bounce_count: u64, request_id: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            client,
            kind: EnvelopeKind::Request,
            bounce_count,
            request_id,
            payload,
        }
    }

    pub fn response(client: Vec<u8>, bounce_count: u64, request_id: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            client,
            kind: EnvelopeKind::Response,
            bounce_count,
            request_id,
            payload,
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ready,
    Heartbeat,
    Shutdown,
    Envelope(Envelope),
}

impl Message {
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        match self {
            Message::Ready => vec![vec![MARKER_READY]],
            Message::Heartbeat => vec![vec![MARKER_HEARTBEAT]],
            Message::Shutdown => vec![vec![MARKER_SHUTDOWN]],
            Message::Envelope(env) => vec![
                env.client.clone(),
                Vec::new(),
                vec![env.kind.marker()],
                env.bounce_count.to_string().into_bytes(),
                env.request_id.clone(),
                Vec::new(),
                env.payload.clone(),
            ],
        }
    }

    pub fn from_frames(mut frames: Vec<Vec<u8>>) -> Result<Message> {
        match frames.len() {
            1 => match frames[0].as_slice() {
                [MARKER_READY] => Ok(Message::Ready),
                [MARKER_HEARTBEAT] => Ok(Message::Heartbeat),
                [MARKER_SHUTDOWN] => Ok(Message::Shutdown),
                other => Err(Error::Wire(format!(
                    "unknown single-frame marker {other:?}"
                ))),
            },
            7 => {
                if !frames[1].is_empty() || !frames[5].is_empty() {
                    return Err(Error::Wire("envelope delimiter frames not empty".into()));
                }
                let kind = match frames[2].as_slice() {
                    [MARKER_REQUEST] => EnvelopeKind::Request,
                    [MARKER_RESPONSE] => EnvelopeKind::Response,
                    other => {
                        return Err(Error::Wire(format!("unknown envelope marker {other:?}")))
                    }
                };
                let bounce_count = std::str::from_utf8(&frames[3])
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| Error::Wire("malformed bounce count frame".into()))?;
                let payload = frames.pop().expect("7 frames");
                frames.pop();
                let request_id = frames.pop().expect("5 frames");
                Ok(Message::Envelope(Envelope {
                    client: std::mem::take(&mut frames[0]),
                    kind,
                    bounce_count,
                    request_id,
                    payload,
                }))
            }
            n => Err(Error::Wire(format!("unexpected message of {n} frames"))),
        }
    }
}

/// Write one multipart message.
pub fn write_message<W: Write>(w: &mut W, msg: &Message) -> io::Result<()> {
    let frames = msg.to_frames();
    w.write_all(&[frames.len() as u8])?;
    for frame in &frames {
        w.write_all(&(frame.len() as u32).to_be_bytes())?;
        w.write_all(frame)?;
    }
    w.flush()
}

/// Read one multipart message, honoring the reader's timeout as a poll:
/// returns `Ok(None)` when no message arrived before the deadline. A timeout
/// mid-message, a closed stream, or a malformed shape is an error.
pub fn poll_message<R: Read>(r: &mut R) -> Result<Option<Message>> {
    let mut count = [0u8; 1];
    match r.read(&mut count) {
        Ok(0) => return Err(Error::Wire("connection closed by peer".into())),
        Ok(_) => {}
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    }

    let count = count[0];
    if count == 0 || count > MAX_FRAMES {
        return Err(Error::Wire(format!("invalid frame count {count}")));
    }

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len = [0u8; 4];
        r.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Wire(format!("frame of {len} bytes exceeds limit")));
        }
        let mut frame = vec![0u8; len];
        r.read_exact(&mut frame)?;
        frames.push(frame);
    }
    Message::from_frames(frames).map(Some)
}

/// Block until one full message arrives.
pub fn read_message<R: Read>(r: &mut R) -> Result<Message> {
    loop {
        if let Some(msg) = poll_message(r)? {
            return Ok(msg);
        }
    }
}

/// Announce the connecting side's socket identity (u8 length + bytes).
pub fn write_identity<W: Write>(w: &mut W, identity: &str) -> io::Result<()> {
    let bytes = identity.as_bytes();
    w.write_all(&[bytes.len() as u8])?;
    w.write_all(bytes)?;
    w.flush()
}

/// Read the peer's identity preamble.
pub fn read_identity<R: Read>(r: &mut R) -> Result<String> {
    let mut len = [0u8; 1];
    r.read_exact(&mut len)?;
    let mut bytes = vec![0u8; len[0] as usize];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| Error::Wire("identity is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(msg: Message) -> Message {
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).unwrap();
        read_message(&mut Cursor::new(buf)).unwrap()
    }

    #[test]
    fn test_control_messages_roundtrip() {
        assert_eq!(roundtrip(Message::Ready), Message::Ready);
        assert_eq!(roundtrip(Message::Heartbeat), Message::Heartbeat);
        assert_eq!(roundtrip(Message::Shutdown), Message::Shutdown);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let msg = Message::Envelope(Envelope::request(
            b"0A3F-1B2C".to_vec(),
            2,
            b"REQ-ID".to_vec(),
            br#"{"kind":"op"}"#.to_vec(),
        ));
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_bounce_count_is_ascii() {
        let msg = Message::Envelope(Envelope::response(
            b"id".to_vec(),
            13,
            b"rid".to_vec(),
            b"{}".to_vec(),
        ));
        let frames = msg.to_frames();
        assert_eq!(frames.len(), 7);
        assert_eq!(frames[2], vec![MARKER_RESPONSE]);
        assert_eq!(frames[3], b"13".to_vec());
        assert!(frames[1].is_empty() && frames[5].is_empty());
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(Message::from_frames(vec![b"good".to_vec(), b"bye".to_vec()]).is_err());
        assert!(Message::from_frames(vec![vec![0x7f]]).is_err());

        let mut frames = Message::Envelope(Envelope::request(
            b"c".to_vec(),
            0,
            b"r".to_vec(),
            b"{}".to_vec(),
        ))
        .to_frames();
        frames[3] = b"not-a-number".to_vec();
        assert!(Message::from_frames(frames).is_err());
    }

    #[test]
    fn test_closed_stream_is_an_error() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(poll_message(&mut empty).is_err());
    }

    #[test]
    fn test_identity_preamble() {
        let mut buf = Vec::new();
        write_identity(&mut buf, "0A3F-1B2C").unwrap();
        assert_eq!(read_identity(&mut Cursor::new(buf)).unwrap(), "0A3F-1B2C");
    }
}
