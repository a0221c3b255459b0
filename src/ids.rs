//! Message id ordering
//!
//! OpenCode assigns ids of the form `<prefix>_<sortable>` where the
//! sortable remainder grows with creation time. Comparing two ids only
//! makes sense when both remainders are long enough to carry that
//! timestamp; shorter ids (client-generated placeholders, malformed
//! values) are treated as incomparable so they can never be mistaken
//! for "older" history.

use std::cmp::Ordering;

/// Minimum length of the sortable remainder for an id to take part in
/// ordering decisions.
pub const MIN_SORTABLE_SUFFIX_LEN: usize = 12;

/// Strip a leading alphanumeric `<prefix>_` token from an id.
///
/// ```
/// use openchamber_sync::ids::sortable_suffix;
///
/// assert_eq!(sortable_suffix("msg_01JABCDEF"), "01JABCDEF");
/// assert_eq!(sortable_suffix("plain"), "plain");
/// ```
pub fn sortable_suffix(id: &str) -> &str {
    match id.split_once('_') {
        Some((prefix, rest))
            if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            rest
        }
        _ => id,
    }
}

/// Compare two ids by creation order.
///
/// Returns `None` when either sortable remainder is shorter than
/// [`MIN_SORTABLE_SUFFIX_LEN`].
pub fn compare_ids(a: &str, b: &str) -> Option<Ordering> {
    let a = sortable_suffix(a);
    let b = sortable_suffix(b);
    if a.len() < MIN_SORTABLE_SUFFIX_LEN || b.len() < MIN_SORTABLE_SUFFIX_LEN {
        return None;
    }
    Some(a.cmp(b))
}

/// Whether `candidate` was created after `reference`.
///
/// Incomparable ids count as newer: callers use this to decide whether
/// an event may be dropped, and a false "older" verdict would lose data.
pub fn is_newer(candidate: &str, reference: &str) -> bool {
    !matches!(
        compare_ids(candidate, reference),
        Some(Ordering::Less | Ordering::Equal)
    )
}

/// Whether `candidate` is provably newer than `reference`.
///
/// Unlike [`is_newer`], incomparable ids return `false`. Used where a
/// positive ordering claim is needed (e.g. "this message supersedes that
/// one").
pub fn is_strictly_newer(candidate: &str, reference: &str) -> bool {
    matches!(compare_ids(candidate, reference), Some(Ordering::Greater))
}
