//! NATS-style subject matching.
//!
//! - `*` matches exactly one segment
//! - `>` matches one or more trailing segments
//!
//! Used by the in-process broker so that its routing agrees with the
//! JetStream consumer filters built from [`crate::Subscription`].

/// Check if a filter pattern matches a concrete subject.
///
/// - `chat.events.p1.*` matches `chat.events.p1.b0`
/// - `chat.events.*.b1` matches `chat.events.p1.b1`
/// - `chat.>` matches `chat.events.p1.b1`
pub fn matches_subject(pattern: &str, subject: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let subject_parts: Vec<&str> = subject.split('.').collect();
    matches_parts(&pattern_parts, &subject_parts)
}

fn matches_parts(pattern_parts: &[&str], subject_parts: &[&str]) -> bool {
    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_parts.len() && si < subject_parts.len() {
        match pattern_parts[pi] {
            ">" => return true,
            "*" => {}
            literal if literal == subject_parts[si] => {}
            _ => return false,
        }
        pi += 1;
        si += 1;
    }

    pi == pattern_parts.len() && si == subject_parts.len()
}
