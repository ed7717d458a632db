//! Assignment eligibility rules.

use chasqui_store::advisors::StatusAction;
use chasqui_store::Store;

use crate::error::Result;

/// Why an advisor cannot take a chat right now. `None` means eligible.
pub fn ineligibility_reason(store: &Store, advisor_id: &str) -> Result<Option<String>> {
    let advisor = store.get_advisor(advisor_id)?;
    if advisor.is_manually_offline {
        return Ok(Some("manually offline".into()));
    }
    if !store.is_online(advisor_id)? {
        return Ok(Some("no open session".into()));
    }
    match store.effective_status(advisor_id)? {
        Some(status) if status.action == StatusAction::Accept => {}
        Some(status) => {
            return Ok(Some(format!("status action is {}", status.action.as_str())));
        }
        // No status catalogue configured at all, treat as accepting.
        None => {}
    }

    // Capacity: attending count must stay below the smallest cap among the
    // queues the advisor participates in.
    let queues = store.queues_for_advisor(advisor_id)?;
    if queues.is_empty() {
        return Ok(Some("not a member of any queue".into()));
    }
    let cap = queues.iter().map(|q| q.max_concurrent).min().unwrap_or(0);
    let attending = store.attending_count(advisor_id)?;
    if attending >= cap {
        return Ok(Some(format!("at capacity ({attending}/{cap})")));
    }

    Ok(None)
}

pub fn is_eligible(store: &Store, advisor_id: &str) -> Result<bool> {
    Ok(ineligibility_reason(store, advisor_id)?.is_none())
}

/// Filter a queue's roster down to currently eligible advisors, keeping
/// roster order.
pub fn eligible_members(store: &Store, queue_id: &str) -> Result<Vec<String>> {
    let mut eligible = Vec::new();
    for advisor_id in store.queue_member_ids(queue_id)? {
        if is_eligible(store, &advisor_id)? {
            eligible.push(advisor_id);
        }
    }
    Ok(eligible)
}
