// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Progress marker of a sync job.

use std::ops::RangeInclusive;

/// First block that a job has not scanned yet.
///
/// # Description
///
/// The checkpoint only moves forward, and only by a whole range that starts at the current position. Blocks are
/// therefore never skipped, and a range that failed to commit is scanned again from the same block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint {
    from_block: u64,
}

impl Checkpoint {
    pub fn new(from_block: u64) -> Self {
        Self { from_block }
    }

    pub fn from_block(&self) -> u64 {
        self.from_block
    }

    /// Range to scan next given the chain head and the maximum batch size.
    ///
    /// Returns `None` when the job is already past the head.
    pub fn next_range(&self, head: u64, batch_size: u64) -> Option<RangeInclusive<u64>> {
        if self.from_block > head {
            return None;
        }
        let span = batch_size.max(1) - 1;
        let to_block = head.min(self.from_block.saturating_add(span));
        Some(self.from_block..=to_block)
    }

    /// Moves past a committed range.
    ///
    /// Ranges that do not start at the current position are ignored, they would either leave a gap or rewind the
    /// job.
    pub fn advance(&mut self, range: &RangeInclusive<u64>) -> bool {
        if *range.start() != self.from_block || range.end() < range.start() {
            return false;
        }
        self.from_block = range.end() + 1;
        true
    }
}
