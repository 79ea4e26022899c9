//! Progress tracking for catch-up replays.
//!
//! When the sync manager replays a range of blocks from the block store it records every
//! height it applied. The tracker logs progress on long replays and reports heights that were
//! skipped, which would mean the wallet missed a block.

use itertools::Itertools;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Heights applied during one catch-up
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
    /// Height the replay started from, exclusive
    start_height: u32,
    /// Height the replay is heading for
    target_height: u32,
    processed_heights: BTreeSet<u32>,
    /// Blocks that changed at least one record
    blocks_with_changes: usize,
    /// Last height at which we logged progress
    last_logged_height: u32,
}

impl SyncProgressTracker {
    pub fn new(start_height: u32, target_height: u32) -> Self {
        Self {
            start_height,
            target_height,
            processed_heights: BTreeSet::new(),
            blocks_with_changes: 0,
            last_logged_height: start_height,
        }
    }

    /// Record that the block at `height` was applied
    pub fn record_processed(&mut self, height: u32, changed: bool) {
        self.processed_heights.insert(height);
        if changed {
            self.blocks_with_changes += 1;
        }
    }

    pub fn highest_processed_height(&self) -> u32 {
        self.processed_heights
            .last()
            .copied()
            .unwrap_or(self.start_height)
    }

    pub fn is_complete(&self) -> bool {
        self.highest_processed_height() >= self.target_height && self.check_for_gaps().is_empty()
    }

    /// Missing height ranges as (last processed, next processed) pairs
    pub fn check_for_gaps(&self) -> Vec<(u32, u32)> {
        std::iter::once(self.start_height)
            .chain(self.processed_heights.iter().copied())
            .tuple_windows()
            .filter(|(a, b)| b - a > 1)
            .collect()
    }

    /// Log progress every 1000 blocks or when forced
    pub fn log_progress(&mut self, force: bool) {
        let highest = self.highest_processed_height();
        let should_log = force || highest.saturating_sub(self.last_logged_height) >= 1000;

        if should_log && !self.processed_heights.is_empty() {
            info!(
                "Catch-up progress: height {} of {}, {} blocks changed the wallet",
                highest, self.target_height, self.blocks_with_changes
            );
            self.last_logged_height = highest;
        }
    }

    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            start_height: self.start_height,
            target_height: self.target_height,
            highest_processed_height: self.highest_processed_height(),
            blocks_processed: self.processed_heights.len(),
            blocks_with_changes: self.blocks_with_changes,
            gaps: self.check_for_gaps(),
        }
    }

    /// Warn about every gap; returns whether the replay was contiguous.
    pub fn validate_completion(&self) -> bool {
        let gaps = self.check_for_gaps();
        for (start, end) in &gaps {
            warn!("Gap detected: missing heights between {} and {}", start, end);
        }
        gaps.is_empty()
    }
}

/// Statistics about one catch-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub start_height: u32,
    pub target_height: u32,
    pub highest_processed_height: u32,
    pub blocks_processed: usize,
    pub blocks_with_changes: usize,
    pub gaps: Vec<(u32, u32)>,
}

impl SyncStats {
    /// Get a human-readable summary of the catch-up statistics
    pub fn summary(&self) -> String {
        format!(
            "Catch-up from {} to {}: {} blocks applied, {} with wallet changes{}",
            self.start_height,
            self.highest_processed_height,
            self.blocks_processed,
            self.blocks_with_changes,
            if self.gaps.is_empty() {
                String::new()
            } else {
                format!(" ({} gaps)", self.gaps.len())
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_replay_is_complete() {
        let mut tracker = SyncProgressTracker::new(10, 13);
        for height in 11..=13 {
            tracker.record_processed(height, height == 12);
        }

        assert!(tracker.is_complete());
        assert!(tracker.validate_completion());
        let stats = tracker.get_stats();
        assert_eq!(stats.blocks_processed, 3);
        assert_eq!(stats.blocks_with_changes, 1);
        assert_eq!(
            stats.summary(),
            "Catch-up from 10 to 13: 3 blocks applied, 1 with wallet changes"
        );
    }

    #[test]
    fn skipped_heights_are_reported() {
        let mut tracker = SyncProgressTracker::new(10, 15);
        tracker.record_processed(12, false);
        tracker.record_processed(13, false);
        tracker.record_processed(15, false);

        assert_eq!(tracker.check_for_gaps(), vec![(10, 12), (13, 15)]);
        assert!(!tracker.is_complete());
        assert!(tracker.get_stats().summary().ends_with("(2 gaps)"));
    }

    #[test]
    fn nothing_processed_is_incomplete() {
        let tracker = SyncProgressTracker::new(4, 5);
        assert_eq!(tracker.highest_processed_height(), 4);
        assert!(!tracker.is_complete());
    }
}
