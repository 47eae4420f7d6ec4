//! Pipeline invariants.

use super::ConnectionState;

/// INVARIANT-1: Monotonic connection state.
/// A connection never returns to an earlier lifecycle state.
pub fn invariant_no_downgrade(from: ConnectionState, to: ConnectionState) -> bool {
    to >= from
}

/// INVARIANT-2: Single publisher.
/// At most one connection is ACTIVE at any instant.
pub fn invariant_single_active<I>(states: I) -> bool
where
    I: IntoIterator<Item = ConnectionState>,
{
    states
        .into_iter()
        .filter(|state| *state == ConnectionState::Active)
        .count()
        <= 1
}

/// INVARIANT-3: Forward-only streaming.
/// The streaming block number only decreases on a peer-directed rewind.
pub fn invariant_streaming_progress(
    previous: Option<u64>,
    next: Option<u64>,
    peer_directed_rewind: bool,
) -> bool {
    match (previous, next) {
        (Some(previous), Some(next)) => next >= previous || peer_directed_rewind,
        (Some(_), None) => false,
        (None, _) => true,
    }
}
