// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod fair_share;
pub mod interleaved_wrr;
pub mod least_busy;
pub mod least_used;
pub mod round_robin;
pub mod weighted_round_robin;

pub use fair_share::FairShare;
pub use interleaved_wrr::InterleavedWeightedRoundRobin;
pub use least_busy::LeastBusy;
pub use least_used::LeastUsed;
pub use round_robin::RoundRobin;
pub use weighted_round_robin::WeightedRoundRobin;

/// Immutable per-handler snapshot a strategy selects over. Index positions
/// are dense and stable for the duration of one `choose` call.
#[derive(Debug, Clone, Copy)]
pub struct HandlerView {
    pub index: usize,
    pub busy: bool,
    pub accepting: bool,
    pub active: usize,
    pub completed: u64,
    pub busy_time_ns: u64,
}

/// Optional dispatch hint: prefer the affinity handler when it is idle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChoiceHint {
    pub affinity: Option<usize>,
}

/// Picks a handler for the next task. Strategies keep their own stats
/// tables, indexed the same way as the views handed to `choose`.
pub trait WorkerChoiceStrategy: Send {
    fn name(&self) -> &'static str;

    /// Seed internal state for a newly-seen handler index. Called before
    /// that index can ever be selected.
    fn init_handler(&mut self, index: usize, view: &HandlerView);

    fn choose(&mut self, handlers: &[HandlerView]) -> Option<usize>;
}

/// Owns the active strategy, seeds newly-seen handler slots, applies the
/// affinity hint, and allows switching strategies at runtime.
pub struct StrategyManager {
    strategy: Box<dyn WorkerChoiceStrategy>,
    seeded: usize,
}

impl StrategyManager {
    pub fn new(strategy: Box<dyn WorkerChoiceStrategy>) -> Self {
        Self {
            strategy,
            seeded: 0,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Swap the strategy; every known handler is re-seeded into the fresh
    /// one before its first selection.
    pub fn set_strategy(&mut self, strategy: Box<dyn WorkerChoiceStrategy>) {
        self.strategy = strategy;
        self.seeded = 0;
    }

    pub fn choose(
        &mut self,
        handlers: &[HandlerView],
        hint: Option<&ChoiceHint>,
    ) -> Option<usize> {
        while self.seeded < handlers.len() {
            let view = &handlers[self.seeded];
            self.strategy.init_handler(self.seeded, view);
            self.seeded += 1;
        }

        if let Some(hint) = hint
            && let Some(idx) = hint.affinity
            && let Some(view) = handlers.get(idx)
            && view.accepting
            && !view.busy
        {
            return Some(idx);
        }

        self.strategy.choose(handlers)
    }
}

impl std::fmt::Debug for StrategyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyManager")
            .field("strategy", &self.strategy.name())
            .field("seeded", &self.seeded)
            .finish()
    }
}
