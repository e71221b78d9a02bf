// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Lock-free SPSC task ring over a shared byte region.
//!
//! Entries pack `(slot_index: u32, priority: u32)` into 64 bits and refer
//! to payload slots owned by the shared-memory channel. When the ring is
//! full, `push` fails and the caller spills to the in-memory queue.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::{
    error::{ErrorKind, PoolError},
    shm::region::SharedRegion,
};

// Region layout: head cursor at 0, tail cursor at CACHE_LINE, entries
// (status word + packed value, 16 bytes apiece) from ENTRIES_OFF.
const CACHE_LINE: usize = 64;
const ENTRIES_OFF: usize = 2 * CACHE_LINE;
const ENTRY_SIZE: usize = 16;

const ENTRY_EMPTY: u32 = 0;
const ENTRY_WRITING: u32 = 1;
const ENTRY_FULL: u32 = 2;

/// One queue entry: a channel slot reference plus its scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingEntry {
    pub slot_index: u32,
    pub priority: u32,
}

impl RingEntry {
    #[inline]
    pub fn pack(self) -> u64 {
        (u64::from(self.priority) << 32) | u64::from(self.slot_index)
    }

    #[inline]
    pub fn unpack(raw: u64) -> Self {
        Self {
            slot_index: raw as u32,
            priority: (raw >> 32) as u32,
        }
    }
}

/// SPSC ring: one producer (admission) and one consumer (dispatch loop).
///
/// Cursors are stored monotone and masked with `capacity - 1` on use;
/// wrap-around is benign modular arithmetic.
pub struct SharedRingQueue {
    region: Arc<SharedRegion>,
    capacity: u32,
}

impl SharedRingQueue {
    pub fn region_size(capacity: u32) -> usize {
        ENTRIES_OFF + capacity as usize * ENTRY_SIZE
    }

    /// Allocate a fresh ring. `capacity` must be a power of two.
    pub fn create(capacity: u32) -> Result<Self, PoolError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(PoolError::new(
                ErrorKind::LimitExceeded,
                format!("ring capacity must be a power of two, got {capacity}"),
            ));
        }
        let region = SharedRegion::alloc(Self::region_size(capacity))?;
        Ok(Self { region, capacity })
    }

    /// Attach to an existing ring region (the other endpoint).
    pub fn attach(region: Arc<SharedRegion>, capacity: u32) -> Result<Self, PoolError> {
        if !capacity.is_power_of_two()
            || region.len() < Self::region_size(capacity)
        {
            return Err(PoolError::new(
                ErrorKind::SharedMemoryUnavailable,
                "ring region too small for declared capacity",
            ));
        }
        Ok(Self { region, capacity })
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.capacity - 1
    }

    #[inline]
    fn entry_status_off(&self, idx: u32) -> usize {
        ENTRIES_OFF + (idx & self.mask()) as usize * ENTRY_SIZE
    }

    fn entry_value(&self, idx: u32) -> &AtomicU64 {
        self.region.atomic_u64(self.entry_status_off(idx) + 8)
    }

    /// Reserve-then-check push. Fails with Backpressure when the ring is
    /// full or the reserved entry is still being drained.
    pub fn push(&self, entry: RingEntry) -> Result<(), PoolError> {
        let head = self.region.atomic_u32(0);
        let tail = self.region.atomic_u32(CACHE_LINE);

        let reserved = head.fetch_add(1, Ordering::AcqRel);
        if reserved.wrapping_sub(tail.load(Ordering::Acquire)) >= self.capacity {
            head.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::new(ErrorKind::Backpressure, "task ring full"));
        }

        let status = self.region.atomic_u32(self.entry_status_off(reserved));
        if status
            .compare_exchange(
                ENTRY_EMPTY,
                ENTRY_WRITING,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            head.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::new(
                ErrorKind::Backpressure,
                "task ring entry still draining",
            ));
        }

        self.entry_value(reserved).store(entry.pack(), Ordering::Relaxed);
        status.store(ENTRY_FULL, Ordering::Release);
        Ok(())
    }

    pub fn pop(&self) -> Option<RingEntry> {
        let tail = self.region.atomic_u32(CACHE_LINE);
        let idx = tail.load(Ordering::Relaxed);

        let status = self.region.atomic_u32(self.entry_status_off(idx));
        if status.load(Ordering::Acquire) != ENTRY_FULL {
            return None;
        }
        let raw = self.entry_value(idx).load(Ordering::Relaxed);
        status.store(ENTRY_EMPTY, Ordering::Release);
        tail.fetch_add(1, Ordering::AcqRel);
        Some(RingEntry::unpack(raw))
    }

    /// Atomic `head - tail`; may lag by at most one concurrent operation.
    pub fn len(&self) -> usize {
        let head = self.region.atomic_u32(0).load(Ordering::Acquire);
        let tail = self.region.atomic_u32(CACHE_LINE).load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.capacity) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

impl std::fmt::Debug for SharedRingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRingQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
