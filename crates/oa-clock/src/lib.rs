//! Monotonic timestamps and request-ID generation.
//!
//! Every timestamp the agent records (`Request`, `Attempt`, `Response`,
//! `NodeSpecs`, `InterfaceSpecs`) comes from [`now`], a thin wrapper over
//! [`std::time::Instant`] so ordering between recorded events stays
//! monotonic regardless of wall-clock adjustments.

use std::time::{Duration, Instant};

use rand::Rng;

/// Length of a request id in printable ASCII characters.
pub const REQ_ID_LEN: usize = 10;

const REQ_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Monotonic instant, cheap to `Copy` and safe to compare across threads.
///
/// Wraps [`Instant`] rather than exposing it directly so call sites don't
/// reach for wall-clock time by habit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(Instant);

impl Timestamp {
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }

    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        self.0.duration_since(earlier.0)
    }
}

/// Returns the current monotonic timestamp.
pub fn now() -> Timestamp {
    Timestamp(Instant::now())
}

/// Generates a fresh `REQ_ID_LEN`-character alphanumeric request id.
///
/// Uniqueness against the local request history is the caller's
/// responsibility (`oa-proto::registry` retries this until it finds an id
/// absent from both the live and historical tables).
pub fn gen_req_id() -> String {
    let mut rng = rand::thread_rng();
    (0..REQ_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..REQ_ID_ALPHABET.len());
            REQ_ID_ALPHABET[idx] as char
        })
        .collect()
}

/// Samples a uniform duration in `[min, max]`, clamping to `[min, min]` if
/// `max < min` (mirrors `SIMULATOR_EXEC_MAX < SIMULATOR_EXEC_MIN` falling
/// back to a degenerate range rather than panicking — `oa-config` applies
/// the documented `[0, 1]` fallback before this is ever called).
pub fn uniform_duration(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = max - min;
    let frac: f64 = rand::thread_rng().gen_range(0.0..=1.0);
    min + Duration::from_secs_f64(span.as_secs_f64() * frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_id_has_correct_length_and_alphabet() {
        let id = gen_req_id();
        assert_eq!(id.len(), REQ_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn req_ids_are_not_trivially_repeated() {
        let a = gen_req_id();
        let b = gen_req_id();
        assert_ne!(a, b, "two consecutive req_ids collided (1-in-62^10 odds)");
    }

    #[test]
    fn timestamps_are_monotonic() {
        let t1 = now();
        std::thread::sleep(Duration::from_millis(1));
        let t2 = now();
        assert!(t2 >= t1);
    }

    #[test]
    fn uniform_duration_falls_back_when_max_lt_min() {
        let d = uniform_duration(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn uniform_duration_stays_in_range() {
        for _ in 0..100 {
            let d = uniform_duration(Duration::from_millis(100), Duration::from_millis(200));
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }
}
