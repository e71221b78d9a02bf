// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write;

use rand::RngExt;

/// Fixed per-task bookkeeping cost charged against `max_queue_memory` on
/// top of the payload itself.
const TASK_OVERHEAD_BYTES: usize = 256;

/// Estimate the queue-memory footprint of one task.
pub fn estimate_task_bytes(method: &str, params: &[u8]) -> usize {
    TASK_OVERHEAD_BYTES + method.len() + params.len()
}

/// Generates a random channel token (8 bytes) and returns:
/// - `[u8; 8]` for direct use in region headers
/// - `String` containing its hexadecimal representation (no prefix)
pub fn generate_channel_token() -> ([u8; 8], String) {
    let mut token = [0u8; 8];
    rand::rng().fill(&mut token);

    let mut hex = String::with_capacity(16);
    for byte in &token {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }

    (token, hex)
}
