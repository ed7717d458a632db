//! Advisor selection per distribution mode.

use chasqui_store::queues::{DistributionMode, Queue};
use chasqui_store::Store;

use crate::error::Result;

/// Pick the next advisor from the eligible set, or `None` for manual
/// queues / empty sets.
pub fn select_advisor(store: &Store, queue: &Queue, eligible: &[String]) -> Result<Option<String>> {
    if eligible.is_empty() {
        return Ok(None);
    }
    match queue.distribution_mode {
        DistributionMode::Manual => Ok(None),
        DistributionMode::RoundRobin => {
            let cursor = store.advance_rr_cursor(&queue.id)?;
            let index = (cursor as usize) % eligible.len();
            Ok(Some(eligible[index].clone()))
        }
        DistributionMode::LeastBusy => {
            let mut best: Option<(i64, Option<i64>, &String)> = None;
            for advisor_id in eligible {
                let attending = store.attending_count(advisor_id)?;
                let last = store.get_advisor(advisor_id)?.last_assignment_at;
                let candidate = (attending, last, advisor_id);
                best = Some(match best {
                    None => candidate,
                    Some(current) => {
                        if candidate.0 < current.0
                            // tie: oldest (or never) last_assignment_at wins
                            || (candidate.0 == current.0 && candidate.1 < current.1)
                        {
                            candidate
                        } else {
                            current
                        }
                    }
                });
            }
            Ok(best.map(|(_, _, id)| id.clone()))
        }
    }
}
