//! Random identifiers for sessions and tool calls.

/// Returns `bytes` random bytes rendered as lowercase hex.
///
/// Falls back to a time-derived value when the OS entropy source is
/// unavailable; identifiers only need to be unique within one data
/// directory, and callers retry on collision.
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    if getrandom::fill(&mut buf).is_err() {
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_le_bytes();
        for (index, byte) in buf.iter_mut().enumerate() {
            *byte = nanos[index % nanos.len()] ^ (index as u8).wrapping_mul(31);
        }
    }
    buf.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Session identifiers: short enough to type, eight hex characters.
pub fn new_session_id() -> String {
    random_hex(4)
}

/// Correlation ids for tool calls that arrive from a provider without one.
pub fn new_tool_call_id() -> String {
    format!("call_{}", random_hex(8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_eight_hex_chars() {
        let id = new_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn tool_call_ids_are_prefixed_and_distinct() {
        let first = new_tool_call_id();
        let second = new_tool_call_id();
        assert!(first.starts_with("call_"));
        assert_eq!(first.len(), "call_".len() + 16);
        assert_ne!(first, second);
    }
}
