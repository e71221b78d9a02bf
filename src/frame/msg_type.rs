// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Helpers for encoding / decoding the message-type octet of every frame
//! header.
//!
//! The octet is a plain 8-bit code; values outside the known set make the
//! whole frame invalid at the codec layer.

use core::fmt;
use std::convert::TryFrom;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// All message types understood by the runtime.
///
/// 1..=3 are the task exchange, 5/6 the liveness probe, 10 batch envelopes,
/// 11..=14 control traffic, 20..=22 the shared-channel chunking protocol.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    #[default]
    TaskRequest = 1,
    TaskResponse = 2,
    TaskError = 3,
    HeartbeatReq = 5,
    HeartbeatRes = 6,
    Batch = 10,
    Cleanup = 11,
    CleanupResponse = 12,
    Terminate = 13,
    Event = 14,
    ChunkStart = 20,
    ChunkData = 21,
    ChunkEnd = 22,
}

impl MsgType {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::TaskRequest,
            2 => Self::TaskResponse,
            3 => Self::TaskError,
            5 => Self::HeartbeatReq,
            6 => Self::HeartbeatRes,
            10 => Self::Batch,
            11 => Self::Cleanup,
            12 => Self::CleanupResponse,
            13 => Self::Terminate,
            14 => Self::Event,
            20 => Self::ChunkStart,
            21 => Self::ChunkData,
            22 => Self::ChunkEnd,
            _ => return None,
        })
    }
}

/// Returned when the octet carries an undefined message type.
#[derive(Debug, Error)]
#[error("unknown message type: 0x{0:02x}")]
pub struct UnknownMsgType(pub u8);

impl TryFrom<u8> for MsgType {
    type Error = UnknownMsgType;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        MsgType::from_u8(byte).ok_or(UnknownMsgType(byte))
    }
}

/// Wire-safe, zero-copy message-type octet.
/// Transparent over `u8`, so it can live inside the zerocopy frame header.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawMsgType(u8);

impl RawMsgType {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub fn known(&self) -> Option<MsgType> {
        MsgType::from_u8(self.0)
    }

    #[inline]
    pub fn set_known(&mut self, t: MsgType) {
        self.0 = t as u8;
    }
}

impl From<MsgType> for RawMsgType {
    fn from(t: MsgType) -> Self {
        Self(t as u8)
    }
}

impl fmt::Debug for RawMsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.known() {
            Some(t) => write!(f, "{t:?}"),
            None => write!(f, "RawMsgType(0x{:02X})", self.0),
        }
    }
}
