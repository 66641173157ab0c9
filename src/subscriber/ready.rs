// src/subscriber/ready.rs

//! RDY budget distribution across a subscriber's connections.

/// A readiness snapshot for one connection, keyed by `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyState {
    pub address: String,
    /// The currently granted ready count.
    pub ready: u64,
    /// Unix milliseconds of the last message received, 0 when none yet.
    pub last_message_at_ms: u64,
}

/// Computes new per-connection ready counts for a concurrency budget.
///
/// When the budget covers every connection, each gets `floor(C / N)`; the
/// remainder is withheld so the aggregate never exceeds the budget. When
/// it does not, single credits rotate toward the connections that have
/// gone longest without a message: the `C` least recently active idle
/// connections are granted `RDY 1`, and as many of the least recently
/// active granted connections are zeroed, so no connection starves across
/// poll intervals.
///
/// Only assignments that may differ from the current grant are returned;
/// untouched connections keep what they have.
pub fn distribute(states: &[ReadyState], concurrency: u64) -> Vec<(String, u64)> {
    let count = states.len() as u64;
    if count == 0 {
        return Vec::new();
    }

    // Paused: revoke every outstanding grant.
    if concurrency == 0 {
        return states
            .iter()
            .filter(|s| s.ready > 0)
            .map(|s| (s.address.clone(), 0))
            .collect();
    }

    if concurrency >= count {
        let share = concurrency / count;
        return states
            .iter()
            .map(|state| (state.address.clone(), share))
            .collect();
    }

    let mut granted: Vec<&ReadyState> = states.iter().filter(|s| s.ready > 0).collect();
    let mut idle: Vec<&ReadyState> = states.iter().filter(|s| s.ready == 0).collect();
    granted.sort_by_key(|s| s.last_message_at_ms);
    idle.sort_by_key(|s| s.last_message_at_ms);

    let mut assignments = Vec::new();
    let grants = (concurrency as usize).min(idle.len());
    for state in &idle[..grants] {
        assignments.push((state.address.clone(), 1));
    }
    let zeroed = idle.len().min(granted.len());
    for state in &granted[..zeroed] {
        assignments.push((state.address.clone(), 0));
    }
    assignments
}
