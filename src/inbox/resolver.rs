//! Ordering resolver: which claimable rows may run now.
//!
//! In sequential mode a row `(C, n)` may run only when
//! - it has no series key, or
//! - `n` is the first sequence value, or
//! - a row `(C, n - 1)` is processed.
//!
//! Everything else waits, untouched, for a later cycle.

use std::fmt;
use std::str::FromStr;

use tracing::{trace, warn};

use crate::store::{CandidateOrder, InboxEvent, InboxLog, InboxStatus, StoreResult};

/// How the processor picks rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectionMode {
    /// Oldest first, no ordering constraint.
    Unordered,
    /// Per-series ascending sequence.
    #[default]
    Sequential,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMode::Unordered => "unordered",
            SelectionMode::Sequential => "sequential",
        }
    }

    /// Candidate order the store should return for this mode.
    pub fn candidate_order(&self) -> CandidateOrder {
        match self {
            SelectionMode::Unordered => CandidateOrder::Arrival,
            SelectionMode::Sequential => CandidateOrder::Series,
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unordered" => Ok(SelectionMode::Unordered),
            "sequential" => Ok(SelectionMode::Sequential),
            other => Err(format!("unknown selection mode: {}", other)),
        }
    }
}

/// Candidates split into rows to run now and rows left waiting.
#[derive(Debug, Default)]
pub struct Resolution {
    pub eligible: Vec<InboxEvent>,
    pub deferred: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct OrderingResolver {
    mode: SelectionMode,
    first_sequence: i64,
}

impl Default for OrderingResolver {
    fn default() -> Self {
        Self::new(SelectionMode::default(), 1)
    }
}

impl OrderingResolver {
    pub fn new(mode: SelectionMode, first_sequence: i64) -> Self {
        Self {
            mode,
            first_sequence,
        }
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Filter `candidates` (already in the mode's candidate order) down to at
    /// most `limit` runnable rows.
    pub fn resolve<U>(
        &self,
        uow: &mut U,
        candidates: Vec<InboxEvent>,
        limit: usize,
    ) -> StoreResult<Resolution>
    where
        U: InboxLog + ?Sized,
    {
        let mut resolution = Resolution::default();
        for candidate in candidates {
            if resolution.eligible.len() >= limit {
                break;
            }
            if self.is_eligible(uow, &candidate)? {
                resolution.eligible.push(candidate);
            } else {
                resolution.deferred += 1;
            }
        }
        Ok(resolution)
    }

    fn is_eligible<U>(&self, uow: &mut U, candidate: &InboxEvent) -> StoreResult<bool>
    where
        U: InboxLog + ?Sized,
    {
        if self.mode == SelectionMode::Unordered {
            return Ok(true);
        }
        let Some((correlation_id, sequence)) = candidate.series() else {
            return Ok(true);
        };
        if sequence <= self.first_sequence {
            return Ok(true);
        }

        match uow.series_status(correlation_id, sequence - 1)? {
            Some(InboxStatus::Processed) => Ok(true),
            Some(InboxStatus::DeadLetter) => {
                warn!(
                    event_id = %candidate.id,
                    correlation_id,
                    sequence_number = sequence,
                    "Predecessor dead-lettered; series blocked until it is replayed"
                );
                Ok(false)
            }
            status => {
                trace!(
                    event_id = %candidate.id,
                    correlation_id,
                    sequence_number = sequence,
                    predecessor = ?status,
                    "Waiting on predecessor"
                );
                Ok(false)
            }
        }
    }
}
