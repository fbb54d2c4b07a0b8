//! Retry backoff policy for queue job redelivery.

/// Default exponential multiplier when not specified
pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BackoffConfig {
    /// No delay between retries (immediate retry)
    #[default]
    None,
    /// Linear backoff: delay = base_delay_ms * attempt_number
    Linear { base_delay_ms: i32 },
    /// Exponential backoff: delay = base_delay_ms * multiplier^(attempt_number - 1)
    Exponential { base_delay_ms: i32, multiplier: f64 },
}

impl BackoffConfig {
    /// The queue's default policy: 5s base, doubling per attempt.
    pub fn queue_default(base_delay_ms: i32) -> Self {
        Self::Exponential {
            base_delay_ms,
            multiplier: DEFAULT_EXPONENTIAL_MULTIPLIER,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            BackoffConfig::None => "none",
            BackoffConfig::Linear { .. } => "linear",
            BackoffConfig::Exponential { .. } => "exponential",
        }
    }

    pub fn base_delay_ms(&self) -> i32 {
        match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => *base_delay_ms,
            BackoffConfig::Exponential { base_delay_ms, .. } => *base_delay_ms,
        }
    }

    pub fn calculate_delay_ms(&self, attempt_number: i32) -> i64 {
        if attempt_number <= 0 {
            return 0;
        }
        match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => {
                if *base_delay_ms <= 0 {
                    return 0;
                }
                (*base_delay_ms as i64) * (attempt_number as i64)
            }
            BackoffConfig::Exponential {
                base_delay_ms,
                multiplier,
            } => {
                if *base_delay_ms <= 0 {
                    return 0;
                }
                // delay = base_delay * multiplier^(attempt - 1)
                let exp = (attempt_number - 1) as f64;
                let factor = multiplier.powf(exp);
                ((*base_delay_ms as f64) * factor) as i64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_none_always_returns_zero_delay() {
        let config = BackoffConfig::None;
        assert_eq!(config.calculate_delay_ms(0), 0);
        assert_eq!(config.calculate_delay_ms(1), 0);
        assert_eq!(config.calculate_delay_ms(10), 0);
    }

    #[test]
    fn backoff_linear_calculates_correctly() {
        // delay = base_delay * attempt_number
        let config = BackoffConfig::Linear {
            base_delay_ms: 1000,
        };
        assert_eq!(config.calculate_delay_ms(0), 0);
        assert_eq!(config.calculate_delay_ms(1), 1000);
        assert_eq!(config.calculate_delay_ms(2), 2000);
        assert_eq!(config.calculate_delay_ms(5), 5000);
    }

    #[test]
    fn backoff_exponential_calculates_correctly() {
        // delay = base_delay * multiplier^(attempt - 1)
        let config = BackoffConfig::Exponential {
            base_delay_ms: 1000,
            multiplier: 2.0,
        };
        assert_eq!(config.calculate_delay_ms(1), 1000); // 1000 * 2^0
        assert_eq!(config.calculate_delay_ms(2), 2000); // 1000 * 2^1
        assert_eq!(config.calculate_delay_ms(3), 4000); // 1000 * 2^2
        assert_eq!(config.calculate_delay_ms(4), 8000); // 1000 * 2^3
    }

    #[test]
    fn backoff_queue_default_is_exponential() {
        let config = BackoffConfig::queue_default(5000);
        assert_eq!(config.kind_str(), "exponential");
        assert_eq!(config.base_delay_ms(), 5000);
        assert_eq!(config.calculate_delay_ms(1), 5000);
        assert_eq!(config.calculate_delay_ms(2), 10000);
        assert_eq!(config.calculate_delay_ms(3), 20000);
    }

    #[test]
    fn backoff_handles_zero_base_delay() {
        let linear = BackoffConfig::Linear { base_delay_ms: 0 };
        assert_eq!(linear.calculate_delay_ms(5), 0);

        let exponential = BackoffConfig::Exponential {
            base_delay_ms: 0,
            multiplier: 2.0,
        };
        assert_eq!(exponential.calculate_delay_ms(5), 0);
    }

    #[test]
    fn backoff_exponential_handles_large_attempts() {
        let config = BackoffConfig::Exponential {
            base_delay_ms: 1,
            multiplier: 2.0,
        };
        let delay_30 = config.calculate_delay_ms(31); // 2^30
        let delay_31 = config.calculate_delay_ms(32); // 2^31
        assert!(delay_30 > 0);
        assert!(delay_31 > delay_30);
    }
}
