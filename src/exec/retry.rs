use std::thread;
use std::time::Duration;

const RETRYABLE_CODES: [i32; 2] = [1, 124];

/// Bounded retry decision for one step. `max_retries = 0` means run once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
    retryable: bool,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
            retryable: false,
        }
    }

    /// Provider steps retry on exit codes 1 and 124 by default, bounded by
    /// the run-level retry setting.
    pub fn for_provider(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            delay_ms,
            retryable: true,
        }
    }

    /// Raw commands only retry when the step declares `retries`; the same
    /// exit codes become retryable then.
    pub fn for_command(retries: Option<(u32, u64)>) -> Self {
        match retries {
            Some((max_retries, delay_ms)) => Self {
                max_retries,
                delay_ms,
                retryable: true,
            },
            None => Self::none(),
        }
    }

    pub fn should_retry(&self, exit_code: i32, attempt: u32) -> bool {
        if !self.retryable || attempt >= self.max_retries {
            return false;
        }
        RETRYABLE_CODES.contains(&exit_code)
    }

    pub fn wait(&self) {
        if self.delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.delay_ms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_policy_retries_only_retryable_codes_within_bounds() {
        let policy = RetryPolicy::for_provider(2, 0);
        assert!(policy.should_retry(1, 0));
        assert!(policy.should_retry(124, 1));
        assert!(!policy.should_retry(1, 2));
        assert!(!policy.should_retry(2, 0));
        assert!(!policy.should_retry(0, 0));
    }

    #[test]
    fn commands_without_retries_never_retry() {
        let policy = RetryPolicy::for_command(None);
        assert!(!policy.should_retry(1, 0));
        let with_retries = RetryPolicy::for_command(Some((1, 0)));
        assert!(with_retries.should_retry(124, 0));
        assert!(!with_retries.should_retry(124, 1));
    }
}
