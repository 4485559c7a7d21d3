//! Compression trigger.

use crate::session::SessionBuffer;

/// Decide whether the turn just appended should start a compression cycle.
///
/// Only assistant turns can trigger, so a cycle always ends on a complete
/// exchange and never cuts off a reply that has not arrived yet.
pub fn should_compress(buffer: &SessionBuffer, is_assistant_turn: bool, threshold: usize) -> bool {
    is_assistant_turn && buffer.turn_count_since_reset() >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionKey, Speaker};

    #[test]
    fn test_threshold_on_assistant_turn() {
        let mut buf = SessionBuffer::new(SessionKey::group("g"), 10);
        buf.append(Speaker::User, "alice", "hi");
        assert!(!should_compress(&buf, true, 2));
        buf.append(Speaker::Assistant, "bot", "hello");
        assert!(should_compress(&buf, true, 2));
    }

    #[test]
    fn test_never_on_user_turn() {
        let mut buf = SessionBuffer::new(SessionKey::group("g"), 10);
        for _ in 0..5 {
            buf.append(Speaker::User, "alice", "spam");
        }
        assert!(!should_compress(&buf, false, 2));
    }

    #[test]
    fn test_interleavings_only_fire_on_assistant() {
        // Every user/assistant pattern of length 6, threshold 3
        for pattern in 0u32..64 {
            let mut buf = SessionBuffer::new(SessionKey::private("p"), 100);
            for i in 0..6 {
                let is_assistant = pattern & (1 << i) != 0;
                let speaker = if is_assistant { Speaker::Assistant } else { Speaker::User };
                buf.append(speaker, "x", "y");
                let fired = should_compress(&buf, is_assistant, 3);
                assert_eq!(fired, is_assistant && i + 1 >= 3);
            }
        }
    }
}
