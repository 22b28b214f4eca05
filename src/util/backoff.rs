use std::cmp::min;
use std::time::Duration;

/// Delays between reconnect attempts, doubling after every failed attempt up to a cap. The sum
///  of all delays handed out since the last reset is tracked so callers can enforce an overall
///  retry budget.
pub struct ExponentialBackoff {
    current: Duration,
    total_waited: Duration,

    config_initial: Duration,
    config_max: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = min(initial, max);
        ExponentialBackoff {
            current: initial,
            total_waited: Duration::ZERO,
            config_initial: initial,
            config_max: max,
        }
    }

    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.current;
        self.total_waited += result;
        self.current = min(self.current.saturating_mul(2), self.config_max);
        result
    }

    pub fn reset(&mut self) {
        self.current = self.config_initial;
        self.total_waited = Duration::ZERO;
    }

    pub fn total_waited(&self) -> Duration {
        self.total_waited
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::initial(100, 10_000, vec![100])]
    #[case::doubling(100, 10_000, vec![100, 200, 400, 800])]
    #[case::capped(100, 500, vec![100, 200, 400, 500, 500])]
    #[case::initial_above_max(1000, 300, vec![300, 300])]
    fn test_next_delay(#[case] initial: u64, #[case] max: u64, #[case] expected: Vec<u64>) {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(initial), Duration::from_millis(max));
        let actual = expected.iter()
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
        assert_eq!(backoff.total_waited(), Duration::from_millis(expected.iter().sum()));
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.total_waited(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
