use rand::Rng;
use std::time::Duration;

/// Uniform random delay between lock-poll attempts.
///
/// The [15, 50] ms range de-synchronizes contenders that arrived together;
/// a fixed delay would have them hammer the backend in lockstep.
pub(crate) fn poll_backoff() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(15..=50))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_in_range() {
        for _ in 0..200 {
            let delay = poll_backoff();
            assert!(delay >= Duration::from_millis(15));
            assert!(delay <= Duration::from_millis(50));
        }
    }
}
