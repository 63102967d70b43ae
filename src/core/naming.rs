//! Deterministic identifiers for pool identities.
//!
//! Every client id and topic name is a pure function of a prefix and an
//! identity index. Both engines go through [`topic_slot`], so a publisher
//! configured with `topic-count = N` and a subscriber configured with
//! `topics-per-subscriber = N` address the same topics for the same index.

/// Client id of the identity at `index`, e.g. `mqtt-loadtest-sub3`.
pub fn client_id(prefix: &str, index: usize) -> String {
    format!("{prefix}{index}")
}

/// Numeric topic slot for `sub_slot` of the identity at `index`.
///
/// Identities own the contiguous, non-overlapping range
/// `[index * per_identity, (index + 1) * per_identity)`.
#[inline]
pub fn topic_slot(index: usize, per_identity: usize, sub_slot: usize) -> u64 {
    debug_assert!(sub_slot < per_identity);
    index as u64 * per_identity as u64 + sub_slot as u64
}

/// Topic address of `sub_slot` for the identity at `index`.
pub fn topic_name(prefix: &str, index: usize, per_identity: usize, sub_slot: usize) -> String {
    format!("{prefix}{}", topic_slot(index, per_identity, sub_slot))
}

/// Full initial topic set of the identity at `index`, in sub-slot order.
pub fn topic_set(prefix: &str, index: usize, per_identity: usize) -> Vec<String> {
    (0..per_identity)
        .map(|sub_slot| topic_name(prefix, index, per_identity, sub_slot))
        .collect()
}

/// Topic set swept by the background re-subscription loop.
///
/// The sweep slots start right after the initial range of all
/// `identity_count` identities, so they never overlap any identity's initial
/// set nor another identity's sweep set.
pub fn resubscribe_topic_set(
    prefix: &str,
    index: usize,
    per_identity: usize,
    identity_count: usize,
) -> Vec<String> {
    topic_set(prefix, identity_count + index, per_identity)
}
