//! # Segmented glob matching for event types.
//!
//! Patterns and event types are dotted names (`order.created`). A pattern
//! segment of `*` matches any single non-empty type segment; a bare `*`
//! pattern matches every type. There is no multi-segment wildcard: segment
//! counts must agree.
//!
//! ```rust
//! use durabus::matches;
//!
//! assert!(matches("*", "anything.at.all"));
//! assert!(matches("order.*", "order.created"));
//! assert!(!matches("order.*", "order.item.created"));
//! assert!(matches("order.*.shipped", "order.123.shipped"));
//! assert!(!matches("order.*.shipped", "order.shipped"));
//! ```

/// Returns true if `event_type` satisfies `pattern`.
///
/// Pure segment-by-segment comparison; no regex involved.
pub fn matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let type_segments: Vec<&str> = event_type.split('.').collect();

    if pattern_segments.len() != type_segments.len() {
        return false;
    }

    pattern_segments
        .iter()
        .zip(type_segments.iter())
        .all(|(p, t)| if *p == "*" { !t.is_empty() } else { p == t })
}
