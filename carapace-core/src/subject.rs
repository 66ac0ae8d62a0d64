//! Subject matching and validation.
//!
//! Subjects are dot-separated tokens. In a subscription pattern `*` matches
//! exactly one token and `>` (only as the last token) matches one or more
//! remaining tokens.

use smallvec::SmallVec;

/// Single-token wildcard.
pub const WILDCARD_ONE: &str = "*";
/// Tail wildcard.
pub const WILDCARD_TAIL: &str = ">";

type Tokens<'a> = SmallVec<[&'a str; 8]>;

fn tokens(subject: &str) -> Tokens<'_> {
    subject.split('.').collect()
}

/// Check whether `subject` is matched by the subscription `pattern`.
///
/// ```
/// use carapace_core::subject::matches;
///
/// assert!(matches("orders.*.created", "orders.eu.created"));
/// assert!(matches("orders.>", "orders.eu.created"));
/// assert!(!matches("orders.>", "orders"));
/// assert!(!matches("orders.*", "orders.eu.created"));
/// ```
#[must_use]
pub fn matches(pattern: &str, subject: &str) -> bool {
    let pattern = tokens(pattern);
    let subject = tokens(subject);

    for (i, p) in pattern.iter().enumerate() {
        if *p == WILDCARD_TAIL && i == pattern.len() - 1 {
            return subject.len() > i;
        }
        match subject.get(i) {
            Some(s) if *p == WILDCARD_ONE || p == s => {}
            _ => return false,
        }
    }
    pattern.len() == subject.len()
}

/// Returns true if `subject` contains wildcard tokens.
#[must_use]
pub fn has_wildcards(subject: &str) -> bool {
    subject
        .split('.')
        .any(|t| t == WILDCARD_ONE || t == WILDCARD_TAIL)
}

/// Check that a subject can be placed in a control line.
///
/// Rejects empty subjects, empty tokens and whitespace. Wildcards are only
/// accepted when `allow_wildcards` is set, and `>` only as the last token.
#[must_use]
pub fn is_valid(subject: &str, allow_wildcards: bool) -> bool {
    if subject.is_empty() || subject.bytes().any(|b| b.is_ascii_whitespace()) {
        return false;
    }
    let toks = tokens(subject);
    let last = toks.len() - 1;
    toks.iter().enumerate().all(|(i, t)| {
        if t.is_empty() {
            return false;
        }
        match *t {
            WILDCARD_ONE => allow_wildcards,
            WILDCARD_TAIL => allow_wildcards && i == last,
            _ => true,
        }
    })
}

/// Check a queue group name.
#[must_use]
pub fn is_valid_queue(queue: &str) -> bool {
    !queue.is_empty() && !queue.bytes().any(|b| b.is_ascii_whitespace())
}
