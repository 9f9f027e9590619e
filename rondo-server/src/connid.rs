//! Connection id generation.
//!
//! Ids must be unique across the whole fleet without coordination, and they
//! are the sole routing key for cross-instance delivery. Each id is the
//! admission time in milliseconds followed by 80 random bits, rendered as
//! fixed-width lowercase hex — so ids also sort by admission time, which
//! makes logs and queue dumps easy to read.

use rand::Rng;

/// Millisecond timestamps fit in 48 bits until the year 10889.
const TIMESTAMP_BITS: u32 = 48;
const ENTROPY_BITS: u32 = 80;

/// Mint a new connection id: 12 hex digits of timestamp, 20 of entropy.
pub fn generate() -> String {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let ts = now_ms & ((1 << TIMESTAMP_BITS) - 1);
    let entropy = rand::thread_rng().r#gen::<u128>() >> (128 - ENTROPY_BITS);
    format!(
        "{ts:0tw$x}{entropy:0ew$x}",
        tw = (TIMESTAMP_BITS / 4) as usize,
        ew = (ENTROPY_BITS / 4) as usize,
    )
}
