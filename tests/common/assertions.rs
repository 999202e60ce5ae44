//! Event collection and result assertions

use chat_export::{BatchResult, Event, ItemDetail, Outcome, ResolutionTier};
use tokio::sync::broadcast;

/// Drain every event currently buffered on the receiver
pub fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

/// Count events matching a predicate
pub fn count_events<F>(events: &[Event], predicate: F) -> usize
where
    F: Fn(&Event) -> bool,
{
    events.iter().filter(|e| predicate(e)).count()
}

/// `(sequence_id, outcome, tier)` for each entry, ignoring local paths
pub fn outcome_shape(batches: &[BatchResult]) -> Vec<(u64, Outcome, Option<ResolutionTier>)> {
    batches
        .iter()
        .flat_map(|b| b.items.iter())
        .map(|r| {
            let tier = match &r.detail {
                ItemDetail::Media { tier, .. } => Some(*tier),
                _ => None,
            };
            (r.sequence_id.get(), r.outcome, tier)
        })
        .collect()
}

/// Assert sequence ids strictly increase across all batches
pub fn assert_strictly_ordered(ids: &[u64]) {
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1], "out of order: {} then {}", pair[0], pair[1]);
    }
}
