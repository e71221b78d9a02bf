// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::FromBytes as ZFromBytes;

use crate::{
    error::{ErrorKind, PoolError},
    frame::{
        header::{FRAME_MAGIC, FRAME_VERSION, FrameFlags, FrameHeader, HEADER_LEN},
        msg_type::MsgType,
    },
};

/// One header-plus-payload message unit.
///
/// The header is kept as raw wire bytes and viewed zero-copy on demand, so
/// a frame can be moved around without re-encoding.
#[derive(Clone, PartialEq)]
pub struct Frame {
    header_buf: [u8; HEADER_LEN],
    payload: Bytes,
}

impl Frame {
    #[inline]
    pub fn header_view(&self) -> Result<&FrameHeader, PoolError> {
        FrameHeader::ref_from_bytes(self.header_buf.as_slice())
            .map_err(|e| PoolError::invalid_frame(e.to_string()))
    }

    pub fn msg_type(&self) -> Result<MsgType, PoolError> {
        self.header_view()?.msg_type.known().ok_or_else(|| {
            PoolError::new(ErrorKind::UnknownMessageType, "unknown message type")
        })
    }

    pub fn message_id(&self) -> Result<u32, PoolError> {
        Ok(self.header_view()?.message_id.get())
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Serialize header + payload into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        out.put_slice(&self.header_buf);
        out.put_slice(&self.payload);
        out.freeze()
    }

    /// Parse and validate one frame from a contiguous buffer.
    ///
    /// Fails with InvalidFrame when magic or version mismatches, the
    /// declared payload length exceeds the buffer, or `msg_type` is outside
    /// the known set. Trailing bytes beyond the declared payload length are
    /// ignored.
    pub fn decode(buf: &Bytes) -> Result<Self, PoolError> {
        if buf.len() < HEADER_LEN {
            return Err(PoolError::invalid_frame(format!(
                "short frame: {} bytes, header needs {HEADER_LEN}",
                buf.len()
            )));
        }
        let mut header_buf = [0u8; HEADER_LEN];
        header_buf.copy_from_slice(&buf[..HEADER_LEN]);

        let header = FrameHeader::ref_from_bytes(header_buf.as_slice())
            .map_err(|e| PoolError::invalid_frame(e.to_string()))?;

        if header.magic.get() != FRAME_MAGIC {
            return Err(PoolError::invalid_frame(format!(
                "bad magic 0x{:04x}",
                header.magic.get()
            )));
        }
        if header.version != FRAME_VERSION {
            return Err(PoolError::invalid_frame(format!(
                "frame version {} (want {FRAME_VERSION})",
                header.version
            )));
        }
        if header.msg_type.known().is_none() {
            return Err(PoolError::invalid_frame(format!(
                "unknown msg_type 0x{:02x}",
                header.msg_type.raw()
            )));
        }

        let declared = header.payload_length.get() as usize;
        if declared > buf.len() - HEADER_LEN {
            return Err(PoolError::invalid_frame(format!(
                "declared payload {declared} exceeds buffer {}",
                buf.len() - HEADER_LEN
            )));
        }

        Ok(Self {
            header_buf,
            payload: buf.slice(HEADER_LEN..HEADER_LEN + declared),
        })
    }
}

/// Builder for outbound frames; fills the header fields the sending side
/// owns (message id, sequence, priority, flags).
#[derive(Debug, Default)]
pub struct FrameBuilder {
    header: FrameHeader,
    payload: Bytes,
}

impl FrameBuilder {
    pub fn new(msg_type: MsgType, message_id: u32) -> Self {
        Self {
            header: FrameHeader::new(msg_type, message_id),
            payload: Bytes::new(),
        }
    }

    pub fn sequence(mut self, seq: u32) -> Self {
        self.header.sequence.set(seq);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.header.priority = priority;
        self
    }

    pub fn flags(mut self, flags: FrameFlags) -> Self {
        self.header.set_frame_flags(flags);
        self
    }

    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(mut self) -> Result<Frame, PoolError> {
        if self.payload.len() > u32::MAX as usize {
            return Err(PoolError::new(
                ErrorKind::MessageTooLarge,
                format!("payload of {} bytes", self.payload.len()),
            ));
        }
        self.header.payload_length.set(self.payload.len() as u32);

        let mut header_buf = [0u8; HEADER_LEN];
        self.header
            .to_wire_bytes(&mut header_buf)
            .map_err(|e| PoolError::invalid_frame(e.to_string()))?;

        Ok(Frame {
            header_buf,
            payload: self.payload,
        })
    }
}

struct HexPreview<'a>(&'a [u8]);

impl fmt::Debug for HexPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX: usize = 64;
        let slice = if self.0.len() > MAX {
            &self.0[..MAX]
        } else {
            self.0
        };
        write!(f, "\"")?;
        for (i, b) in slice.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02x}")?;
        }
        if self.0.len() > MAX {
            write!(f, " ... (+{} bytes)", self.0.len() - MAX)?;
        }
        write!(f, "\"")
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ds = f.debug_struct("Frame");
        match self.header_view() {
            Ok(h) => ds.field("header", h),
            Err(_) => ds.field("header_raw", &HexPreview(&self.header_buf)),
        };
        ds.field("payload_len", &self.payload.len());
        if !self.payload.is_empty() {
            ds.field("payload_preview", &HexPreview(&self.payload));
        }
        ds.finish()
    }
}
