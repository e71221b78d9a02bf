// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32};

use crate::frame::msg_type::{MsgType, RawMsgType};

/// Fixed size of every frame header on the wire.
pub const HEADER_LEN: usize = 20;

/// `"WP"` little-endian.
pub const FRAME_MAGIC: u16 = 0x5750;

/// Current protocol version; receivers reject anything else.
pub const FRAME_VERSION: u8 = 2;

bitflags! {
    /// Flag octet of the frame header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// Payload references transferable resources owned by the transport.
        const HAS_TRANSFER = 0b0000_0001;
        /// Payload bytes are compressed; the codec passes them through opaque.
        const COMPRESSED   = 0b0000_0010;
    }
}

/// The 20-byte frame header. Everything multi-byte is little-endian.
///
/// `message_id` uniqueness is per-direction-per-handler; `sequence` is a
/// monotone per-endpoint counter used for debugging only, receivers must
/// tolerate gaps.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    pub magic: U16<LittleEndian>,          // 0..2
    pub version: u8,                       // 2
    pub msg_type: RawMsgType,              // 3
    pub flags: u8,                         // 4
    pub priority: u8,                      // 5
    pub message_id: U32<LittleEndian>,     // 6..10
    pub payload_length: U32<LittleEndian>, // 10..14
    pub sequence: U32<LittleEndian>,       // 14..18
    reserved: [u8; 2],                     // 18..20
}

impl FrameHeader {
    pub fn new(msg_type: MsgType, message_id: u32) -> Self {
        Self {
            magic: U16::new(FRAME_MAGIC),
            version: FRAME_VERSION,
            msg_type: msg_type.into(),
            ..Default::default()
        }
        .with_message_id(message_id)
    }

    fn with_message_id(mut self, message_id: u32) -> Self {
        self.message_id.set(message_id);
        self
    }

    #[inline]
    pub fn frame_flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn set_frame_flags(&mut self, flags: FrameFlags) {
        self.flags = flags.bits();
    }

    pub fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != HEADER_LEN {
            bail!("buffer length must be {HEADER_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }
}

const _: () = assert!(size_of::<FrameHeader>() == HEADER_LEN);
