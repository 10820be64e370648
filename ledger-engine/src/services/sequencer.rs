//! Document number generation.
//!
//! Invoice numbers are strictly increasing per tenant: the candidate is the
//! numeric suffix of the most recently created number plus one. Allocation
//! is optimistic: the caller attempts the insert and retries on a
//! uniqueness violation with randomized backoff, and after the retries are
//! spent a timestamp-derived number keeps the operation live at the cost of
//! sequentiality (logged as degraded). Payment numbers are globally unique
//! and non-sequential: timestamp plus random suffix.

use chrono::{DateTime, Utc};
use rand::Rng;

/// Number of optimistic insert attempts before falling back.
pub const MAX_NUMBER_ATTEMPTS: u32 = 5;

/// Prefix and zero-padding for sequential document numbers.
#[derive(Debug, Clone)]
pub struct NumberFormat {
    pub prefix: String,
    pub pad_width: usize,
}

impl Default for NumberFormat {
    fn default() -> Self {
        Self {
            prefix: "INV-".to_string(),
            pad_width: 6,
        }
    }
}

impl NumberFormat {
    /// Next candidate number given the latest issued number, if any.
    ///
    /// The latest number comes from a creation-time ordering, never from
    /// sorting the number column itself.
    pub fn next_candidate(&self, latest: Option<&str>) -> String {
        let next = latest.and_then(parse_numeric_suffix).map_or(1, |n| n + 1);
        format!("{}{:0width$}", self.prefix, next, width = self.pad_width)
    }

    /// Timestamp-derived fallback number; guaranteed live, not sequential.
    pub fn fallback(&self, now: DateTime<Utc>) -> String {
        format!("{}{}", self.prefix, now.timestamp_millis())
    }
}

/// Parse the trailing digit run of a document number.
fn parse_numeric_suffix(number: &str) -> Option<u64> {
    let digits: String = number
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

/// Globally unique, non-sequential payment number.
pub fn payment_number(now: DateTime<Utc>) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("PAY-{}-{}", now.timestamp_millis(), suffix)
}

/// Randomized backoff between optimistic attempts, in milliseconds.
pub fn backoff_ms() -> u64 {
    rand::thread_rng().gen_range(5..=25)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_number_starts_at_one() {
        let format = NumberFormat::default();
        assert_eq!(format.next_candidate(None), "INV-000001");
    }

    #[test]
    fn increments_numeric_suffix() {
        let format = NumberFormat::default();
        assert_eq!(format.next_candidate(Some("INV-000042")), "INV-000043");
        assert_eq!(format.next_candidate(Some("INV-999999")), "INV-1000000");
    }

    #[test]
    fn increments_fallback_numbers_too() {
        let format = NumberFormat::default();
        // A timestamp fallback stays monotonic for subsequent candidates.
        assert_eq!(
            format.next_candidate(Some("INV-1700000000000")),
            "INV-1700000000001"
        );
    }

    #[test]
    fn unparsable_suffix_restarts_at_one() {
        let format = NumberFormat::default();
        assert_eq!(format.next_candidate(Some("LEGACY")), "INV-000001");
    }

    #[test]
    fn custom_prefix_and_padding() {
        let format = NumberFormat {
            prefix: "CN-".to_string(),
            pad_width: 4,
        };
        assert_eq!(format.next_candidate(Some("CN-0009")), "CN-0010");
    }

    #[test]
    fn payment_numbers_carry_prefix_and_suffix() {
        let now = Utc::now();
        let a = payment_number(now);
        let b = payment_number(now);
        assert!(a.starts_with("PAY-"));
        assert_eq!(a.len(), b.len());
        // Same timestamp, random suffixes make collisions negligible.
        assert_ne!(a, b);
    }
}
