//! Ordering of Kinesis sequence numbers
//!
//! Sequence numbers are decimal strings of up to 128 bits, so they are
//! compared by numeric value rather than lexicographically.

use std::cmp::Ordering;

/// Compare two sequence numbers by numeric value.
///
/// Non-numeric tokens fall back to plain string ordering.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a_digits = a.trim_start_matches('0');
    let b_digits = b.trim_start_matches('0');

    if a.bytes().all(|c| c.is_ascii_digit()) && b.bytes().all(|c| c.is_ascii_digit()) {
        a_digits
            .len()
            .cmp(&b_digits.len())
            .then_with(|| a_digits.cmp(b_digits))
    } else {
        a.cmp(b)
    }
}

/// True when `candidate` is strictly after `current`
pub fn is_after(candidate: &str, current: &str) -> bool {
    compare(candidate, current) == Ordering::Greater
}
