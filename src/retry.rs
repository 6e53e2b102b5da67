// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Ladder Encoding
//!
//! This module provides the pure functions behind the delayed-retry ladder:
//! the per-level name and TTL, the binary routing-key tag for a requested
//! wait, and the topic patterns each rung binds with.
//!
//! The ladder has 25 rungs. Rung `i` is a queue holding messages for
//! `2^(i-1)` seconds before dead-lettering them to rung `i+1`'s exchange. A
//! wait is encoded as its 25-digit binary representation: rung `i` only
//! captures messages whose bit `i` is set (the sibling pass-through binding
//! forwards bit-zero messages immediately), so the total time a message
//! spends in the ladder is exactly the binary value of the encoded wait.

/// Number of rungs in the retry ladder.
pub const LEVEL_COUNT: usize = 25;

/// Maximum wait the ladder can encode, in seconds.
pub const MAX_DELAY: u64 = (1 << LEVEL_COUNT) - 1;

/// Entry exchange feeding the first rung.
pub const RETRY_ENTRY: &str = "retry.entry";

/// Exit exchange re-emitting messages that traversed every rung.
pub const RETRY_EXIT: &str = "retry.exit";

/// Name and message TTL of one ladder rung.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RetryLevel {
    pub(crate) name: String,
    pub(crate) message_ttl: u64,
}

/// Returns the rung at the given 1-based level.
///
/// Level 1 holds for one second; each subsequent level doubles. Level
/// `LEVEL_COUNT + 1` is also addressable: it names the queueless exchange
/// the last rung dead-letters into.
pub(crate) fn level_info(level: usize) -> RetryLevel {
    RetryLevel {
        name: format!("retry.level-{}", level),
        message_ttl: (1u64 << (level - 1)) * 1000,
    }
}

/// Encodes a wait as the ladder routing-key prefix.
///
/// The wait is clamped to [`MAX_DELAY`] and rendered as a 25-digit
/// zero-padded binary string, most significant bit first, every digit
/// followed by a `.` separator. The publisher appends the destination queue
/// name directly after the prefix; rung patterns end in `#` so the name
/// rides through every hop untouched.
pub(crate) fn topic_for_wait(wait: u64) -> String {
    let clamped = wait.min(MAX_DELAY);

    let mut tag = String::with_capacity(LEVEL_COUNT * 2);
    for bit in (0..LEVEL_COUNT).rev() {
        tag.push(if clamped >> bit & 1 == 1 { '1' } else { '0' });
        tag.push('.');
    }

    tag
}

/// The routing key a delayed-retry republish enters the ladder with: the
/// encoded wait followed by the destination queue name.
pub(crate) fn delayed_retry_routing_key(wait: u64, queue: &str) -> String {
    format!("{}{}", topic_for_wait(wait), queue)
}

/// Builds the topic pattern rung `level` binds with.
///
/// The pattern has one segment per rung, wildcard everywhere except the
/// given level's position, which is `1` for the capture binding (queue holds
/// the message for the rung's TTL) or `0` for the pass-through binding
/// (message forwarded to the next rung's exchange immediately). Segments are
/// reversed because the routing key is written most significant bit first,
/// and a trailing `#` matches the appended destination name.
pub(crate) fn build_pattern(level: usize, match_one: bool) -> String {
    let mut segments = vec!["*"; LEVEL_COUNT];
    segments[level - 1] = if match_one { "1" } else { "0" };
    segments.reverse();

    format!("{}.#", segments.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_doubles_per_rung() {
        assert_eq!(
            level_info(1),
            RetryLevel {
                name: "retry.level-1".to_owned(),
                message_ttl: 1000,
            }
        );
        assert_eq!(level_info(2).message_ttl, 2000);
        assert_eq!(level_info(25).message_ttl, (1u64 << 24) * 1000);
        assert_eq!(level_info(26).name, "retry.level-26");
    }

    #[test]
    fn zero_wait_is_all_zero_digits() {
        assert_eq!(topic_for_wait(0), "0.".repeat(25));
    }

    #[test]
    fn wait_is_zero_padded_binary_msb_first() {
        // 5 = 0b101, so the tag ends with segments 1, 0, 1.
        let tag = topic_for_wait(5);
        assert_eq!(tag.len(), 50);
        assert!(tag.starts_with("0.0."));
        assert!(tag.ends_with("1.0.1."));
    }

    #[test]
    fn wait_clamps_to_max_delay() {
        assert_eq!(topic_for_wait(u64::MAX), topic_for_wait(MAX_DELAY));
        assert_eq!(topic_for_wait(MAX_DELAY), "1.".repeat(25));
    }

    #[test]
    fn ladder_time_equals_encoded_wait() {
        // The TTLs of the rungs whose bits are set must sum to the wait.
        for wait in [0u64, 1, 2, 5, 1023, 87_000, MAX_DELAY] {
            let held: u64 = (1..=LEVEL_COUNT)
                .filter(|level| wait >> (level - 1) & 1 == 1)
                .map(|level| level_info(level).message_ttl)
                .sum();
            assert_eq!(held, wait * 1000);
        }
    }

    #[test]
    fn routing_key_carries_the_destination_queue() {
        let key = delayed_retry_routing_key(5, "command.charge");
        assert!(key.ends_with("1.0.1.command.charge"));
        assert_eq!(key.split('.').count(), LEVEL_COUNT + 2);
    }

    #[test]
    fn capture_pattern_marks_the_level_bit() {
        // Level 1 is the least significant bit: last of the 25 segments.
        assert_eq!(build_pattern(1, true), format!("{}.1.#", "*.".repeat(24).trim_end_matches('.')));
        // Level 25 is the most significant bit: first segment.
        assert!(build_pattern(25, true).starts_with("1.*."));
        assert!(build_pattern(25, false).starts_with("0.*."));
    }

    #[test]
    fn patterns_cover_every_segment_and_pass_the_name_through() {
        for level in 1..=LEVEL_COUNT {
            let pattern = build_pattern(level, true);
            let segments: Vec<&str> = pattern.split('.').collect();
            assert_eq!(segments.len(), LEVEL_COUNT + 1);
            assert_eq!(segments[LEVEL_COUNT], "#");
            assert_eq!(segments[LEVEL_COUNT - level], "1");
        }
    }

    #[test]
    fn capture_and_pass_through_partition_the_tag() {
        // For any wait, each level matches exactly one of the two patterns.
        let tag = topic_for_wait(19);
        let segments: Vec<&str> = tag.trim_end_matches('.').split('.').collect();
        for level in 1..=LEVEL_COUNT {
            let digit = segments[LEVEL_COUNT - level];
            assert!(digit == "1" || digit == "0");
        }
    }
}
