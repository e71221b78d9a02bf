// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Lock-free slotted channel over a shared byte region.
//!
//! Layout: a 64-byte header followed by `slot_count` equal slots. Header
//! words are 4-byte little-endian: version, flags, send_index, recv_index,
//! slot_size, slot_count, rest reserved. Each slot leads with a 4-byte
//! status word cycling `Empty → Writing → Ready → Reading → Empty`; then
//! `[msg_type:u8][length:u32][payload]`.
//!
//! Indices are stored monotone (wrapping u32) and reduced `mod slot_count`
//! on use. Because `send_index` is reserved with fetch-add before the
//! Empty check and rolled back on failure, and a slot advances
//! `Empty → Writing` only via CAS, at most one writer ever owns a slot;
//! readers serialise the same way through `Ready → Reading`.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::{
    error::{ErrorKind, PoolError},
    frame::msg_type::MsgType,
    shm::{
        chunk::{
            CHUNK_DATA_META, ChunkData, ChunkStart, Reassembler, decode_chunk_end,
            encode_chunk_end,
        },
        region::SharedRegion,
    },
};

pub const CHANNEL_HEADER_SIZE: usize = 64;
pub const CHANNEL_VERSION: u32 = 1;

/// How long a chunk slot may wait for the receiver to drain the ring.
const CHUNK_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// status(4) + msg_type(1) + length(4): bytes of every slot not available
/// to the payload.
pub const SLOT_OVERHEAD: usize = 9;

const VERSION_OFF: usize = 0;
const FLAGS_OFF: usize = 4;
const SEND_IDX_OFF: usize = 8;
const RECV_IDX_OFF: usize = 12;
const SLOT_SIZE_OFF: usize = 16;
const SLOT_COUNT_OFF: usize = 20;

const STATUS_EMPTY: u32 = 0;
const STATUS_WRITING: u32 = 1;
const STATUS_READY: u32 = 2;
const STATUS_READING: u32 = 3;

bitflags! {
    /// Channel flag word in the region header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelFlags: u32 {
        const INITIALIZED = 0b0001;
        const CLOSED      = 0b0010;
        const ERROR       = 0b0100;
        const OVERFLOW    = 0b1000;
    }
}

#[derive(Debug, Default)]
pub struct ChannelStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub chunked_sent: AtomicU64,
    pub send_overflows: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StallProbe {
    send_index: u32,
    recv_index: u32,
    since: Instant,
}

/// One direction of the shared-memory fast path. Producers may be
/// concurrent; consumers may be concurrent; no locks anywhere on the hot
/// path.
pub struct SharedChannel {
    region: Arc<SharedRegion>,
    slot_size: u32,
    slot_count: u32,
    next_message_id: AtomicU32,
    reassembly: Reassembler,
    stats: ChannelStats,
    stall: Mutex<Option<StallProbe>>,
}

impl SharedChannel {
    pub fn region_size(slot_size: u32, slot_count: u32) -> usize {
        CHANNEL_HEADER_SIZE + slot_size as usize * slot_count as usize
    }

    /// Allocate and initialise a fresh channel region.
    pub fn create(slot_size: u32, slot_count: u32) -> Result<Self, PoolError> {
        if (slot_size as usize) <= SLOT_OVERHEAD + CHUNK_DATA_META {
            return Err(PoolError::new(
                ErrorKind::LimitExceeded,
                format!("slot_size {slot_size} leaves no payload room"),
            ));
        }
        if slot_count == 0 {
            return Err(PoolError::new(ErrorKind::LimitExceeded, "slot_count is 0"));
        }
        let region = SharedRegion::alloc(Self::region_size(slot_size, slot_count))?;
        region
            .atomic_u32(VERSION_OFF)
            .store(CHANNEL_VERSION, Ordering::Relaxed);
        region
            .atomic_u32(SLOT_SIZE_OFF)
            .store(slot_size, Ordering::Relaxed);
        region
            .atomic_u32(SLOT_COUNT_OFF)
            .store(slot_count, Ordering::Relaxed);
        region
            .atomic_u32(FLAGS_OFF)
            .store(ChannelFlags::INITIALIZED.bits(), Ordering::Release);
        Ok(Self {
            region,
            slot_size,
            slot_count,
            next_message_id: AtomicU32::new(1),
            reassembly: Reassembler::new(),
            stats: ChannelStats::default(),
            stall: Mutex::new(None),
        })
    }

    /// Attach the opposite endpoint to an already-initialised region.
    pub fn attach(region: Arc<SharedRegion>) -> Result<Self, PoolError> {
        if region.len() < CHANNEL_HEADER_SIZE {
            return Err(PoolError::new(
                ErrorKind::SharedMemoryUnavailable,
                "region smaller than channel header",
            ));
        }
        let version = region.atomic_u32(VERSION_OFF).load(Ordering::Acquire);
        if version != CHANNEL_VERSION {
            return Err(PoolError::new(
                ErrorKind::VersionMismatch,
                format!("channel version {version} (want {CHANNEL_VERSION})"),
            ));
        }
        let flags =
            ChannelFlags::from_bits_truncate(region.atomic_u32(FLAGS_OFF).load(Ordering::Acquire));
        if !flags.contains(ChannelFlags::INITIALIZED) {
            return Err(PoolError::new(
                ErrorKind::SharedMemoryUnavailable,
                "channel region not initialised",
            ));
        }
        let slot_size = region.atomic_u32(SLOT_SIZE_OFF).load(Ordering::Relaxed);
        let slot_count = region.atomic_u32(SLOT_COUNT_OFF).load(Ordering::Relaxed);
        if region.len() < Self::region_size(slot_size, slot_count) {
            return Err(PoolError::new(
                ErrorKind::SharedMemoryUnavailable,
                "region too small for declared slot geometry",
            ));
        }
        Ok(Self {
            region,
            slot_size,
            slot_count,
            next_message_id: AtomicU32::new(1),
            reassembly: Reassembler::new(),
            stats: ChannelStats::default(),
            stall: Mutex::new(None),
        })
    }

    #[inline]
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    #[inline]
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Largest payload one slot can carry.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.slot_size as usize - SLOT_OVERHEAD
    }

    /// Largest data segment one ChunkData slot can carry.
    #[inline]
    pub fn max_chunk_data(&self) -> usize {
        self.max_payload() - CHUNK_DATA_META
    }

    pub fn flags(&self) -> ChannelFlags {
        ChannelFlags::from_bits_truncate(
            self.region.atomic_u32(FLAGS_OFF).load(Ordering::Acquire),
        )
    }

    fn raise_flag(&self, flag: ChannelFlags) {
        self.region
            .atomic_u32(FLAGS_OFF)
            .fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// Mark the channel closed; subsequent sends fail, receives drain.
    pub fn close(&self) {
        self.raise_flag(ChannelFlags::CLOSED);
    }

    pub fn mark_error(&self) {
        self.raise_flag(ChannelFlags::ERROR);
    }

    #[inline]
    fn slot_off(&self, index: u32) -> usize {
        CHANNEL_HEADER_SIZE + (index % self.slot_count) as usize * self.slot_size as usize
    }

    /// Live messages: `send_index - recv_index`, wrapping.
    pub fn pending(&self) -> u32 {
        let send = self.region.atomic_u32(SEND_IDX_OFF).load(Ordering::Acquire);
        let recv = self.region.atomic_u32(RECV_IDX_OFF).load(Ordering::Acquire);
        send.wrapping_sub(recv).min(self.slot_count)
    }

    /// Non-blocking send of one message, chunking transparently when the
    /// payload exceeds one slot.
    pub fn send(&self, msg_type: MsgType, payload: &[u8]) -> Result<(), PoolError> {
        if self.flags().contains(ChannelFlags::CLOSED) {
            return Err(PoolError::new(ErrorKind::ChannelClosed, "channel closed"));
        }
        if payload.len() > self.max_payload() {
            return self.send_chunked(msg_type, payload);
        }
        self.send_slot(msg_type as u8, payload)?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_slot(&self, msg_type: u8, payload: &[u8]) -> Result<(), PoolError> {
        debug_assert!(payload.len() <= self.max_payload());

        let send_index = self.region.atomic_u32(SEND_IDX_OFF);
        let reserved = send_index.fetch_add(1, Ordering::AcqRel);

        let status = self.region.atomic_u32(self.slot_off(reserved));
        if status.load(Ordering::Acquire) != STATUS_EMPTY {
            send_index.fetch_sub(1, Ordering::AcqRel);
            self.raise_flag(ChannelFlags::OVERFLOW);
            self.stats.send_overflows.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::new(ErrorKind::BufferOverflow, "channel full"));
        }
        if status
            .compare_exchange(
                STATUS_EMPTY,
                STATUS_WRITING,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            send_index.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::new(
                ErrorKind::SendFailed,
                "slot contention on reserve",
            ));
        }

        let base = self.slot_off(reserved) + 4;
        self.region.write_bytes(base, &[msg_type]);
        self.region
            .write_bytes(base + 1, &(payload.len() as u32).to_le_bytes());
        if !payload.is_empty() {
            self.region.write_bytes(base + 5, payload);
        }

        status.store(STATUS_READY, Ordering::Release);
        Ok(())
    }

    /// A chunk sequence usually exceeds the slot count, so chunk slots
    /// ride out a full ring with bounded backoff while the receiver
    /// drains, instead of failing like a single-slot send.
    fn send_slot_backoff(&self, msg_type: u8, payload: &[u8]) -> Result<(), PoolError> {
        let deadline = Instant::now() + CHUNK_SEND_TIMEOUT;
        let mut k = 0u32;
        loop {
            match self.send_slot(msg_type, payload) {
                Err(e) if e.kind() == ErrorKind::BufferOverflow => {
                    if self.flags().contains(ChannelFlags::CLOSED) {
                        return Err(PoolError::new(
                            ErrorKind::ChannelClosed,
                            "channel closed mid-chunk",
                        ));
                    }
                    if Instant::now() >= deadline {
                        return Err(e);
                    }
                    if k < 16 {
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                    k = k.wrapping_add(1);
                },
                other => return other,
            }
        }
    }

    fn send_chunked(&self, msg_type: MsgType, payload: &[u8]) -> Result<(), PoolError> {
        let per_chunk = self.max_chunk_data();
        let total_chunks = payload.len().div_ceil(per_chunk) as u32;
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);

        let start = ChunkStart {
            message_id,
            orig_type: msg_type as u8,
            total_chunks,
            total_size: payload.len() as u64,
        };
        self.send_slot_backoff(MsgType::ChunkStart as u8, &start.encode())?;

        for (chunk_index, data) in payload.chunks(per_chunk).enumerate() {
            let body = ChunkData {
                message_id,
                chunk_index: chunk_index as u32,
                data: Bytes::copy_from_slice(data),
            };
            self.send_slot_backoff(MsgType::ChunkData as u8, &body.encode())?;
        }

        self.send_slot_backoff(MsgType::ChunkEnd as u8, &encode_chunk_end(message_id))?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.chunked_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Consume one slot if one is Ready. Returns the raw `(msg_type, body)`
    /// without chunk handling.
    fn recv_slot(&self) -> Result<Option<(u8, Bytes)>, PoolError> {
        let recv_index = self.region.atomic_u32(RECV_IDX_OFF);
        let index = recv_index.load(Ordering::Acquire);

        let status = self.region.atomic_u32(self.slot_off(index));
        if status.load(Ordering::Acquire) != STATUS_READY {
            return Ok(None);
        }
        if status
            .compare_exchange(
                STATUS_READY,
                STATUS_READING,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            // Lost the race to a concurrent reader.
            return Ok(None);
        }

        let base = self.slot_off(index) + 4;
        let mut head = [0u8; 5];
        self.region.read_bytes(base, &mut head);
        let msg_type = head[0];
        let length = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;

        if length > self.max_payload() {
            self.mark_error();
            status.store(STATUS_EMPTY, Ordering::Release);
            recv_index.fetch_add(1, Ordering::AcqRel);
            return Err(PoolError::new(
                ErrorKind::ReceiveFailed,
                format!("slot declares {length} bytes, max {}", self.max_payload()),
            ));
        }

        let mut body = BytesMut::zeroed(length);
        if length > 0 {
            self.region.read_bytes(base + 5, &mut body);
        }

        status.store(STATUS_EMPTY, Ordering::Release);
        recv_index.fetch_add(1, Ordering::AcqRel);
        Ok(Some((msg_type, body.freeze())))
    }

    /// Non-blocking receive of one complete message. Chunk slots are
    /// consumed internally; the reassembled message surfaces on ChunkEnd.
    pub fn try_recv(&self) -> Result<Option<(MsgType, Bytes)>, PoolError> {
        loop {
            let Some((raw_type, body)) = self.recv_slot()? else {
                return Ok(None);
            };
            let msg_type = MsgType::from_u8(raw_type).ok_or_else(|| {
                self.mark_error();
                PoolError::new(
                    ErrorKind::UnknownMessageType,
                    format!("slot msg_type 0x{raw_type:02x}"),
                )
            })?;
            match msg_type {
                MsgType::ChunkStart => {
                    self.reassembly.on_start(ChunkStart::decode(&body)?)?;
                },
                MsgType::ChunkData => {
                    self.reassembly.on_data(ChunkData::decode(&body)?)?;
                },
                MsgType::ChunkEnd => {
                    let message_id = decode_chunk_end(&body)?;
                    let (orig_type, assembled) = self.reassembly.on_end(message_id)?;
                    let orig = MsgType::from_u8(orig_type).ok_or_else(|| {
                        PoolError::new(
                            ErrorKind::UnknownMessageType,
                            format!("reassembled msg_type 0x{orig_type:02x}"),
                        )
                    })?;
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some((orig, assembled)));
                },
                other => {
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some((other, body)));
                },
            }
        }
    }

    /// Blocking receive with an adaptive spin/yield/sleep backoff, bounded
    /// by `timeout`. Wake-ups are polling-based: the slot word is the only
    /// synchronisation shared by both endpoints.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<(MsgType, Bytes)>, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut k = 0u32;
        loop {
            if let Some(msg) = self.try_recv()? {
                return Ok(Some(msg));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if k < 8 {
                std::hint::spin_loop();
            } else if k < 64 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
            k = k.wrapping_add(1);
        }
    }

    /// Partially-reassembled messages still buffered on the receive side.
    pub fn reassembly_pending(&self) -> usize {
        self.reassembly.pending()
    }

    /// Stall detector: when messages are pending but neither index moved
    /// for longer than `threshold`, flip the Error flag so the pool
    /// rebuilds the channel. Returns true once stalled.
    pub fn check_stall(&self, threshold: Duration) -> bool {
        if self.flags().contains(ChannelFlags::ERROR) {
            return true;
        }
        let send = self.region.atomic_u32(SEND_IDX_OFF).load(Ordering::Acquire);
        let recv = self.region.atomic_u32(RECV_IDX_OFF).load(Ordering::Acquire);

        let mut guard = self.stall.lock().unwrap_or_else(|e| e.into_inner());
        if send == recv {
            *guard = None;
            return false;
        }
        match *guard {
            Some(probe) if probe.send_index == send && probe.recv_index == recv => {
                if probe.since.elapsed() >= threshold {
                    warn!(
                        send_index = send,
                        recv_index = recv,
                        "shared channel stalled, marking Error"
                    );
                    self.mark_error();
                    return true;
                }
                false
            },
            _ => {
                *guard = Some(StallProbe {
                    send_index: send,
                    recv_index: recv,
                    since: Instant::now(),
                });
                false
            },
        }
    }
}

impl std::fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedChannel")
            .field("slot_size", &self.slot_size)
            .field("slot_count", &self.slot_count)
            .field("flags", &self.flags())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Both directions of the fast path: each endpoint owns one send half and
/// sees the peer's half as its receive side.
#[derive(Debug)]
pub struct SharedDuplex {
    pub tx: SharedChannel,
    pub rx: SharedChannel,
}

impl SharedDuplex {
    /// Build a connected pair of duplex endpoints over two fresh regions.
    pub fn pair(
        slot_size: u32,
        slot_count: u32,
    ) -> Result<(SharedDuplex, SharedDuplex), PoolError> {
        let a = SharedChannel::create(slot_size, slot_count)?;
        let b = SharedChannel::create(slot_size, slot_count)?;
        let a_rx = SharedChannel::attach(Arc::clone(b.region()))?;
        let b_rx = SharedChannel::attach(Arc::clone(a.region()))?;
        Ok((
            SharedDuplex { tx: a, rx: a_rx },
            SharedDuplex { tx: b, rx: b_rx },
        ))
    }

    pub fn close(&self) {
        self.tx.close();
    }
}
