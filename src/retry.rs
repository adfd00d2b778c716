use std::time::Duration;

use crate::errors::CloneError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Fatal,
}

/// Backoff delay for the given zero-based attempt:
/// `min(max_delay, base * factor^attempt)`. Monotone non-decreasing until the
/// cap, no jitter.
pub fn next_delay(attempt: u32, base: Duration, factor: f64, max_delay: Duration) -> Duration {
    let scaled = base.as_secs_f64() * factor.powi(attempt as i32);
    if !scaled.is_finite() || scaled >= max_delay.as_secs_f64() {
        max_delay
    } else {
        // A factor below 1 can drive the product negative or NaN-adjacent;
        // a delay is never less than zero.
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// Whether retrying can possibly change the outcome. Authentication,
/// conflicts and filesystem trouble never heal by waiting; transport
/// failures and timeouts might.
pub fn classify(err: &CloneError) -> Classification {
    match err {
        CloneError::Network(_) | CloneError::Timeout { .. } | CloneError::Git(_) => {
            Classification::Retryable
        }
        CloneError::Auth { .. }
        | CloneError::Conflict { .. }
        | CloneError::Filesystem { .. }
        | CloneError::Discovery { .. }
        | CloneError::Cancelled => Classification::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn delay_grows_geometrically_until_cap() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        let delays: Vec<Duration> = (0..8).map(|a| next_delay(a, base, 2.0, max)).collect();

        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        assert_eq!(delays[2], Duration::from_secs(8));
        assert_eq!(delays[4], Duration::from_secs(32));
        assert_eq!(delays[5], max);
        assert_eq!(delays[7], max);

        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "delays must be non-decreasing");
        }
    }

    #[test]
    fn delay_never_exceeds_cap_even_on_overflow() {
        let d = next_delay(1000, Duration::from_secs(2), 10.0, Duration::from_secs(30));
        assert_eq!(d, Duration::from_secs(30));
    }

    #[test]
    fn negative_factor_never_panics() {
        let d = next_delay(1, Duration::from_secs(2), -2.0, Duration::from_secs(30));
        assert_eq!(d, Duration::ZERO);
        let d = next_delay(3, Duration::from_secs(2), -2.0, Duration::from_secs(30));
        assert_eq!(d, Duration::ZERO);
    }

    #[test]
    fn transport_failures_are_retryable() {
        assert_eq!(
            classify(&CloneError::Network("connection reset".into())),
            Classification::Retryable
        );
        assert_eq!(
            classify(&CloneError::Timeout { seconds: 600 }),
            Classification::Retryable
        );
        assert_eq!(
            classify(&CloneError::Git("early EOF".into())),
            Classification::Retryable
        );
    }

    #[test]
    fn auth_conflict_and_fs_are_fatal() {
        assert_eq!(
            classify(&CloneError::Auth {
                host: "gerrit.example.org".into(),
                message: "bad credentials".into()
            }),
            Classification::Fatal
        );
        assert_eq!(
            classify(&CloneError::Conflict {
                path: PathBuf::from("repos/a"),
                message: "different remote".into()
            }),
            Classification::Fatal
        );
        assert_eq!(
            classify(&CloneError::Filesystem {
                path: PathBuf::from("repos"),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied")
            }),
            Classification::Fatal
        );
    }

    #[test]
    fn cancellation_is_fatal() {
        // Retrying a transfer the run itself aborted cannot succeed.
        assert_eq!(classify(&CloneError::Cancelled), Classification::Fatal);
    }
}
