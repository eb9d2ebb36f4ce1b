//! Binary wire formats: inbound control messages and outbound frame chunks.
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

// ── Message tags ────────────────────────────────────────────────────

pub const MSG_FRAME: u8 = 0x01;
pub const MSG_TOUCH: u8 = 0x02;
pub const MSG_FRAME_STATS: u8 = 0x03;
pub const MSG_OPEN_URL: u8 = 0x04;
pub const MSG_KEEPALIVE: u8 = 0x05;

pub const FLAG_FINAL: u8 = 0x01;
pub const FLAG_FULL_FRAME: u8 = 0x02;

const RECT_HEADER_LEN: usize = 12;
const MAX_DEVICE_ID_LEN: usize = 255;

// ── Control channel (client → server) ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchPhase {
    Start,
    Move,
    End,
    Cancel,
}

impl TouchPhase {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TouchPhase::Start),
            1 => Some(TouchPhase::Move),
            2 => Some(TouchPhase::End),
            3 => Some(TouchPhase::Cancel),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TouchPhase::Start => 0,
            TouchPhase::Move => 1,
            TouchPhase::End => 2,
            TouchPhase::Cancel => 3,
        }
    }
}

/// A touch point in display coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchInput {
    pub phase: TouchPhase,
    pub pointer_id: u8,
    pub x: u16,
    pub y: u16,
}

/// Statistics a client reports after drawing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientFrameStats {
    pub frame_id: u32,
    pub bytes: u32,
    pub decode_ms: u16,
    pub draw_ms: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Touch(TouchInput),
    FrameStats(ClientFrameStats),
    OpenUrl(String),
    Keepalive,
}

fn need(buf: &[u8], kind: &'static str, needed: usize) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            kind,
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

impl ControlMessage {
    /// Decode one inbound message. Unknown tags yield `Ok(None)`; trailing
    /// bytes after a fixed-size payload are ignored.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let (&tag, mut payload) = data.split_first().ok_or(ProtocolError::Empty)?;
        let msg = match tag {
            MSG_TOUCH => {
                need(payload, "touch", 6)?;
                let raw_phase = payload.get_u8();
                let phase =
                    TouchPhase::from_u8(raw_phase).ok_or(ProtocolError::InvalidValue {
                        kind: "touch",
                        field: "phase",
                        value: raw_phase as u32,
                    })?;
                ControlMessage::Touch(TouchInput {
                    phase,
                    pointer_id: payload.get_u8(),
                    x: payload.get_u16(),
                    y: payload.get_u16(),
                })
            }
            MSG_FRAME_STATS => {
                need(payload, "frame stats", 12)?;
                ControlMessage::FrameStats(ClientFrameStats {
                    frame_id: payload.get_u32(),
                    bytes: payload.get_u32(),
                    decode_ms: payload.get_u16(),
                    draw_ms: payload.get_u16(),
                })
            }
            MSG_OPEN_URL => {
                let url = std::str::from_utf8(payload)
                    .map_err(|_| ProtocolError::InvalidUtf8("open url"))?;
                ControlMessage::OpenUrl(url.trim().to_string())
            }
            MSG_KEEPALIVE => ControlMessage::Keepalive,
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        match self {
            ControlMessage::Touch(t) => {
                out.put_u8(MSG_TOUCH);
                out.put_u8(t.phase.as_u8());
                out.put_u8(t.pointer_id);
                out.put_u16(t.x);
                out.put_u16(t.y);
            }
            ControlMessage::FrameStats(s) => {
                out.put_u8(MSG_FRAME_STATS);
                out.put_u32(s.frame_id);
                out.put_u32(s.bytes);
                out.put_u16(s.decode_ms);
                out.put_u16(s.draw_ms);
            }
            ControlMessage::OpenUrl(url) => {
                out.put_u8(MSG_OPEN_URL);
                out.extend_from_slice(url.as_bytes());
            }
            ControlMessage::Keepalive => out.put_u8(MSG_KEEPALIVE),
        }
        out
    }
}

// ── Frame channel (server → client) ────────────────────────────────

/// One independently encoded rectangle of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub data: Bytes,
}

impl EncodedRect {
    fn wire_len(&self) -> usize {
        RECT_HEADER_LEN + self.data.len()
    }

    fn write_to(&self, out: &mut BytesMut) {
        out.put_u16(self.x);
        out.put_u16(self.y);
        out.put_u16(self.width);
        out.put_u16(self.height);
        out.put_u32(self.data.len() as u32);
        out.extend_from_slice(&self.data);
    }
}

/// A decoded FRAME chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameChunk {
    pub device_id: String,
    pub frame_id: u32,
    pub chunk_index: u16,
    pub chunk_count: u16,
    pub is_final: bool,
    pub full_frame: bool,
    pub rects: Vec<EncodedRect>,
}

fn truncated_id(device_id: &str) -> &[u8] {
    let bytes = device_id.as_bytes();
    if bytes.len() <= MAX_DEVICE_ID_LEN {
        return bytes;
    }
    // Cut on a char boundary so the id stays valid UTF-8.
    let mut end = MAX_DEVICE_ID_LEN;
    while !device_id.is_char_boundary(end) {
        end -= 1;
    }
    &bytes[..end]
}

fn header_len(id: &[u8]) -> usize {
    // tag, flags, frame id, index, count, id len, id, rect count
    1 + 1 + 4 + 2 + 2 + 1 + id.len() + 2
}

/// Split a frame's rectangles into FRAME messages of at most `max_bytes`
/// each. Rectangles are never split: one that does not fit on its own is
/// sent alone in an oversized message. An empty frame yields no messages.
pub fn pack_chunks(
    device_id: &str,
    frame_id: u32,
    full_frame: bool,
    rects: &[EncodedRect],
    max_bytes: usize,
) -> Result<Vec<Bytes>, ProtocolError> {
    let id = truncated_id(device_id);
    let body_budget = max_bytes.saturating_sub(header_len(id));

    // Group rectangle indices into bodies first; the header needs the count.
    let mut groups: Vec<std::ops::Range<usize>> = Vec::new();
    let mut start = 0;
    let mut body_len = 0;
    for (i, rect) in rects.iter().enumerate() {
        let len = rect.wire_len();
        if i > start && body_len + len > body_budget {
            groups.push(start..i);
            start = i;
            body_len = 0;
        }
        body_len += len;
    }
    if start < rects.len() {
        groups.push(start..rects.len());
    }

    let chunk_count = groups.len();
    if chunk_count > u16::MAX as usize {
        return Err(ProtocolError::TooManyChunks(chunk_count));
    }

    let mut out = Vec::with_capacity(chunk_count);
    for (index, range) in groups.into_iter().enumerate() {
        let group = &rects[range];
        let size = header_len(id) + group.iter().map(EncodedRect::wire_len).sum::<usize>();
        let mut buf = BytesMut::with_capacity(size);

        let mut flags = 0;
        if index + 1 == chunk_count {
            flags |= FLAG_FINAL;
        }
        if full_frame {
            flags |= FLAG_FULL_FRAME;
        }
        buf.put_u8(MSG_FRAME);
        buf.put_u8(flags);
        buf.put_u32(frame_id);
        buf.put_u16(index as u16);
        buf.put_u16(chunk_count as u16);
        buf.put_u8(id.len() as u8);
        buf.extend_from_slice(id);
        buf.put_u16(group.len() as u16);
        for rect in group {
            rect.write_to(&mut buf);
        }
        out.push(buf.freeze());
    }
    Ok(out)
}

/// Parse one FRAME message.
pub fn decode_chunk(data: &[u8]) -> Result<FrameChunk, ProtocolError> {
    let (&tag, mut buf) = data.split_first().ok_or(ProtocolError::Empty)?;
    if tag != MSG_FRAME {
        return Err(ProtocolError::UnknownFrameTag(tag));
    }
    need(buf, "frame", 10)?;
    let flags = buf.get_u8();
    let frame_id = buf.get_u32();
    let chunk_index = buf.get_u16();
    let chunk_count = buf.get_u16();
    let id_len = buf.get_u8() as usize;
    need(buf, "frame", id_len + 2)?;
    let device_id = std::str::from_utf8(&buf[..id_len])
        .map_err(|_| ProtocolError::InvalidUtf8("device id"))?
        .to_string();
    buf.advance(id_len);
    let rect_count = buf.get_u16() as usize;

    let mut rects = Vec::with_capacity(rect_count);
    for _ in 0..rect_count {
        need(buf, "frame", RECT_HEADER_LEN)?;
        let x = buf.get_u16();
        let y = buf.get_u16();
        let width = buf.get_u16();
        let height = buf.get_u16();
        let len = buf.get_u32() as usize;
        need(buf, "frame", len)?;
        let data = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);
        rects.push(EncodedRect {
            x,
            y,
            width,
            height,
            data,
        });
    }

    Ok(FrameChunk {
        device_id,
        frame_id,
        chunk_index,
        chunk_count,
        is_final: flags & FLAG_FINAL != 0,
        full_frame: flags & FLAG_FULL_FRAME != 0,
        rects,
    })
}
