// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Chunking protocol for payloads larger than one channel slot.
//!
//! Slots carry no frame header, so every chunk body embeds the correlating
//! `message_id`. Chunks of one message may interleave with other messages
//! and arrive out of order; the reassembly table tolerates both and
//! delivers the reassembled bytes exactly once, on ChunkEnd.

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;

use crate::error::{ErrorKind, PoolError};

/// Per-ChunkData metadata cost inside the slot payload.
pub const CHUNK_DATA_META: usize = 8;

/// ChunkStart body: `[message_id:u32][orig_type:u8][total_chunks:u32][total_size:u64]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStart {
    pub message_id: u32,
    pub orig_type: u8,
    pub total_chunks: u32,
    pub total_size: u64,
}

impl ChunkStart {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(17);
        out.put_u32_le(self.message_id);
        out.put_u8(self.orig_type);
        out.put_u32_le(self.total_chunks);
        out.put_u64_le(self.total_size);
        out.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PoolError> {
        if buf.len() < 17 {
            return Err(PoolError::new(ErrorKind::MissingField, "short chunk start"));
        }
        Ok(Self {
            message_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            orig_type: buf[4],
            total_chunks: u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]),
            total_size: u64::from_le_bytes([
                buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15], buf[16],
            ]),
        })
    }
}

/// ChunkData body: `[message_id:u32][chunk_index:u32][bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub message_id: u32,
    pub chunk_index: u32,
    pub data: Bytes,
}

impl ChunkData {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(CHUNK_DATA_META + self.data.len());
        out.put_u32_le(self.message_id);
        out.put_u32_le(self.chunk_index);
        out.put_slice(&self.data);
        out.freeze()
    }

    pub fn decode(buf: &Bytes) -> Result<Self, PoolError> {
        if buf.len() < CHUNK_DATA_META {
            return Err(PoolError::new(ErrorKind::MissingField, "short chunk data"));
        }
        Ok(Self {
            message_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            chunk_index: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data: buf.slice(CHUNK_DATA_META..),
        })
    }
}

/// ChunkEnd body: `[message_id:u32]`.
pub fn encode_chunk_end(message_id: u32) -> Bytes {
    Bytes::copy_from_slice(&message_id.to_le_bytes())
}

pub fn decode_chunk_end(buf: &[u8]) -> Result<u32, PoolError> {
    if buf.len() < 4 {
        return Err(PoolError::new(ErrorKind::MissingField, "short chunk end"));
    }
    Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

struct Assembly {
    orig_type: u8,
    total_chunks: u32,
    total_size: u64,
    received: u32,
    parts: Vec<Option<Bytes>>,
}

/// Receiver-side reassembly table keyed by `message_id`.
#[derive(Default)]
pub struct Reassembler {
    table: DashMap<u32, Assembly>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(&self, start: ChunkStart) -> Result<(), PoolError> {
        if self.table.contains_key(&start.message_id) {
            return Err(PoolError::new(
                ErrorKind::DuplicateMessageId,
                format!("chunk start for live message_id {}", start.message_id),
            ));
        }
        self.table.insert(
            start.message_id,
            Assembly {
                orig_type: start.orig_type,
                total_chunks: start.total_chunks,
                total_size: start.total_size,
                received: 0,
                parts: vec![None; start.total_chunks as usize],
            },
        );
        Ok(())
    }

    pub fn on_data(&self, data: ChunkData) -> Result<(), PoolError> {
        let mut entry = self.table.get_mut(&data.message_id).ok_or_else(|| {
            PoolError::new(
                ErrorKind::ReceiveFailed,
                format!("chunk data for unknown message_id {}", data.message_id),
            )
        })?;
        let idx = data.chunk_index as usize;
        if idx >= entry.parts.len() {
            return Err(PoolError::new(
                ErrorKind::ReceiveFailed,
                format!("chunk index {idx} out of range"),
            ));
        }
        if entry.parts[idx].is_none() {
            entry.received += 1;
        }
        entry.parts[idx] = Some(data.data);
        Ok(())
    }

    /// Finish a message: every chunk must have arrived by now.
    pub fn on_end(&self, message_id: u32) -> Result<(u8, Bytes), PoolError> {
        let (_, asm) = self.table.remove(&message_id).ok_or_else(|| {
            PoolError::new(
                ErrorKind::ReceiveFailed,
                format!("chunk end for unknown message_id {message_id}"),
            )
        })?;
        if asm.received != asm.total_chunks {
            return Err(PoolError::new(
                ErrorKind::ReceiveFailed,
                format!(
                    "chunk end with {}/{} chunks for message_id {message_id}",
                    asm.received, asm.total_chunks
                ),
            ));
        }
        let mut out = BytesMut::with_capacity(asm.total_size as usize);
        for part in asm.parts.into_iter().flatten() {
            out.put_slice(&part);
        }
        if out.len() as u64 != asm.total_size {
            return Err(PoolError::new(
                ErrorKind::ReceiveFailed,
                format!(
                    "reassembled {} bytes, expected {} for message_id {message_id}",
                    out.len(),
                    asm.total_size
                ),
            ));
        }
        Ok((asm.orig_type, out.freeze()))
    }

    /// Live partial messages; zero once every chunked message completed.
    pub fn pending(&self) -> usize {
        self.table.len()
    }
}
