//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod payment {
    use super::*;

    pub const NAMESPACE: &str = "payment";

    /// Marks a recent provider status check for one reference
    #[derive(Debug, Clone)]
    pub struct PollThrottleKey {
        pub reference: String,
    }

    impl PollThrottleKey {
        pub fn new(reference: impl Into<String>) -> Self {
            Self {
                reference: reference.into(),
            }
        }
    }

    impl fmt::Display for PollThrottleKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:poll:{}", VERSION, NAMESPACE, self.reference)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_throttle_key() {
        let key = payment::PollThrottleKey::new("R1");
        assert_eq!(key.to_string(), "v1:payment:poll:R1");
    }
}
