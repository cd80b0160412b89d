//! Bearer credential checks for both listeners.
//!
//! Credentials are opaque tokens configured in `[security].auth_tokens`.
//! They are only ever read from the `Authorization` header.

/// Decides whether a presented bearer token is accepted.
pub trait TokenValidator: Send + Sync {
    /// Returns true if `token` is accepted.
    fn validate(&self, token: &str) -> bool;
}

/// Accepts any token from a fixed list.
#[derive(Debug, Clone)]
pub struct StaticTokenValidator {
    tokens: Vec<String>,
}

impl StaticTokenValidator {
    /// Create a validator over `tokens`; blank entries are dropped.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens = tokens
            .into_iter()
            .map(Into::into)
            .filter(|t: &String| !t.trim().is_empty())
            .collect();
        Self { tokens }
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> bool {
        // Check every configured token so timing does not reveal which one matched.
        self.tokens
            .iter()
            .fold(false, |accepted, expected| {
                constant_time_eq(token, expected) | accepted
            })
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Checks an optional `Authorization` header value against `validator`.
pub fn authorize(validator: &dyn TokenValidator, header: Option<&str>) -> bool {
    header
        .and_then(parse_bearer)
        .is_some_and(|token| validator.validate(token))
}

/// Constant-time comparison for equal-length inputs.
fn constant_time_eq(received: &str, expected: &str) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in received.bytes().zip(expected.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer() {
        assert_eq!(parse_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(parse_bearer("bearer   abc123  "), Some("abc123"));
        assert_eq!(parse_bearer("Basic abc123"), None);
        assert_eq!(parse_bearer("Bearer"), None);
        assert_eq!(parse_bearer("Bearer   "), None);
        assert_eq!(parse_bearer(""), None);
    }

    #[test]
    fn test_static_validator() {
        let validator = StaticTokenValidator::new(["token-a", "token-b"]);
        assert!(validator.validate("token-a"));
        assert!(validator.validate("token-b"));
        assert!(!validator.validate("token-c"));
        assert!(!validator.validate("token"));
        assert!(!validator.validate(""));
    }

    #[test]
    fn test_blank_tokens_never_match() {
        let validator = StaticTokenValidator::new(vec![String::new(), "  ".to_string()]);
        assert!(!validator.validate(""));
        assert!(!validator.validate("  "));
    }

    #[test]
    fn test_authorize_header() {
        let validator = StaticTokenValidator::new(["secret"]);
        assert!(authorize(&validator, Some("Bearer secret")));
        assert!(!authorize(&validator, Some("Bearer wrong")));
        assert!(!authorize(&validator, Some("secret")));
        assert!(!authorize(&validator, None));
    }

    #[test]
    fn test_constant_time_eq_different_lengths() {
        assert!(!constant_time_eq("short", "this_is_longer"));
        assert!(constant_time_eq("same", "same"));
    }
}
