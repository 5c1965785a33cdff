use http::header::{HeaderMap, RETRY_AFTER};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Header carrying the bucket's request limit per window
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Header carrying the requests left in the current window
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Header carrying the window reset time as epoch seconds
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Quota state reported by the server on a response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaHeaders {
    /// Requests allowed per window
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the window resets, as (possibly fractional) epoch seconds
    pub reset_epoch: f64,
}

impl QuotaHeaders {
    /// Parse the quota headers from a response.
    ///
    /// Returns `None` if any of the three headers is missing or unparsable;
    /// a partial update is never applied. Lookup is case-insensitive.
    pub fn parse(headers: &HeaderMap) -> Option<Self> {
        let limit = header_str(headers, LIMIT_HEADER)?;
        let remaining = header_str(headers, REMAINING_HEADER)?;
        let reset = header_str(headers, RESET_HEADER)?;

        let parsed = (
            limit.trim().parse::<u32>(),
            remaining.trim().parse::<u32>(),
            reset.trim().parse::<f64>(),
        );

        match parsed {
            (Ok(limit), Ok(remaining), Ok(reset_epoch))
                if limit > 0 && reset_epoch.is_finite() =>
            {
                Some(Self {
                    limit,
                    remaining,
                    reset_epoch,
                })
            }
            _ => {
                debug!(
                    "Ignoring malformed quota headers (limit={:?}, remaining={:?}, reset={:?})",
                    limit, remaining, reset
                );
                None
            }
        }
    }

    /// Time left until the window resets, clamped at zero.
    pub fn reset_after(&self) -> Duration {
        let delta = self.reset_epoch - unix_now();
        if delta > 0.0 {
            Duration::from_secs_f64(delta)
        } else {
            Duration::ZERO
        }
    }
}

/// Parse a `retry-after` header given in (possibly fractional) seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    match value.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Some(Duration::from_secs_f64(secs)),
        _ => {
            debug!("Ignoring malformed retry-after header: {:?}", value);
            None
        }
    }
}

/// Current wall-clock time as epoch seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).expect("valid header"));
        }
        map
    }

    #[test]
    fn test_parse_complete_headers() {
        let map = headers(&[
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "4"),
            ("x-ratelimit-reset", "1470173023"),
        ]);

        let quota = QuotaHeaders::parse(&map).expect("quota headers");
        assert_eq!(quota.limit, 5);
        assert_eq!(quota.remaining, 4);
        assert_eq!(quota.reset_epoch, 1_470_173_023.0);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let mut map = HeaderMap::new();
        map.insert(
            http::HeaderName::from_bytes(b"X-RateLimit-Limit").expect("name"),
            HeaderValue::from_static("10"),
        );
        map.insert(
            http::HeaderName::from_bytes(b"X-RATELIMIT-REMAINING").expect("name"),
            HeaderValue::from_static("0"),
        );
        map.insert(
            http::HeaderName::from_bytes(b"x-RateLimit-Reset").expect("name"),
            HeaderValue::from_static("1470173023.25"),
        );

        let quota = QuotaHeaders::parse(&map).expect("quota headers");
        assert_eq!(quota.limit, 10);
        assert_eq!(quota.remaining, 0);
        assert_eq!(quota.reset_epoch, 1_470_173_023.25);
    }

    #[test]
    fn test_missing_header_means_no_update() {
        let map = headers(&[("x-ratelimit-limit", "5"), ("x-ratelimit-remaining", "4")]);
        assert!(QuotaHeaders::parse(&map).is_none());
    }

    #[test]
    fn test_malformed_headers_are_ignored() {
        let map = headers(&[
            ("x-ratelimit-limit", "five"),
            ("x-ratelimit-remaining", "4"),
            ("x-ratelimit-reset", "1470173023"),
        ]);
        assert!(QuotaHeaders::parse(&map).is_none());

        let negative = headers(&[
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "-1"),
            ("x-ratelimit-reset", "1470173023"),
        ]);
        assert!(QuotaHeaders::parse(&negative).is_none());

        let zero_limit = headers(&[
            ("x-ratelimit-limit", "0"),
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset", "1470173023"),
        ]);
        assert!(QuotaHeaders::parse(&zero_limit).is_none());
    }

    #[test]
    fn test_reset_in_the_past_clamps_to_zero() {
        let quota = QuotaHeaders {
            limit: 1,
            remaining: 0,
            reset_epoch: unix_now() - 30.0,
        };
        assert_eq!(quota.reset_after(), Duration::ZERO);
    }

    #[test]
    fn test_retry_after() {
        assert_eq!(
            retry_after(&headers(&[("retry-after", "1.5")])),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(retry_after(&headers(&[("retry-after", "soon")])), None);
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }
}
