//! Text rules for message bodies
//!
//! Inbound bodies come from arbitrary radios and end up on a terminal, so they
//! are flattened to one line with control characters removed. Outbound text is
//! checked against the transport limit before anything is recorded.

use crate::error::SendError;

/// Strip control characters and collapse line breaks to spaces.
pub fn clean_text(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for c in content.chars() {
        match c {
            '\n' | '\r' | '\t' => {
                if !out.ends_with(' ') {
                    out.push(' ');
                }
            }
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out.trim().to_string()
}

/// Cut `s` to at most `max_bytes` without splitting a UTF-8 sequence.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Normalized inbound body, or `None` when nothing printable remains.
pub fn sanitize_body(content: &str, max_bytes: usize) -> Option<String> {
    let cleaned = clean_text(content);
    let body = truncate_utf8(&cleaned, max_bytes).trim_end();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

/// Check operator text before it is recorded and sent.
///
/// Outbound text is rejected rather than truncated: the operator should see
/// the limit, not a silently shortened message.
pub fn validate_outbound_text(content: &str, max_bytes: usize) -> Result<String, SendError> {
    let cleaned = clean_text(content);
    if cleaned.is_empty() {
        return Err(SendError::Empty);
    }
    if cleaned.len() > max_bytes {
        return Err(SendError::TooLong {
            len: cleaned.len(),
            max: max_bytes,
        });
    }
    Ok(cleaned)
}
