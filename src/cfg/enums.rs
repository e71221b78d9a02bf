// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport flavour selected at pool construction. The core only sees
/// the factory it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    #[default]
    Auto,
    Thread,
    Process,
    Web,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Thread => "thread",
            Self::Process => "process",
            Self::Web => "web",
        };
        f.write_str(s)
    }
}

/// Queue discipline for pending tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStrategy {
    #[default]
    Fifo,
    Lifo,
    Priority,
    /// Caller supplies a key function through the pool builder.
    Custom,
}

/// Worker-selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChoiceStrategy {
    #[default]
    RoundRobin,
    LeastBusy,
    LeastUsed,
    FairShare,
    WeightedRoundRobin,
    InterleavedWeightedRoundRobin,
}

/// What admission does when `maxQueueMemory` would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryPressurePolicy {
    #[default]
    Reject,
    Wait,
    DropOldest,
}
