//! Bearer-token auth for the request layer.

/// Resolved gateway auth configuration. An unset token disables auth
/// (local/dev deployments behind their own perimeter).
#[derive(Debug, Clone, Default)]
pub struct ResolvedAuth {
    pub token: Option<String>,
}

impl ResolvedAuth {
    pub fn enabled(&self) -> bool {
        self.token.is_some()
    }
}

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// Resolve auth config from environment / config values.
pub fn resolve_auth(token: Option<String>) -> ResolvedAuth {
    ResolvedAuth {
        token: token.filter(|t| !t.is_empty()),
    }
}

/// Check a `Bearer <token>` authorization header value.
pub(crate) fn authorize(auth: &ResolvedAuth, header: Option<&str>) -> bool {
    let Some(expected) = auth.token.as_deref() else {
        return true;
    };
    let Some(given) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
        return false;
    };
    safe_equal(given, expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_auth_allows_everything() {
        let auth = resolve_auth(None);
        assert!(authorize(&auth, None));
        assert!(authorize(&auth, Some("Bearer whatever")));
    }

    #[test]
    fn token_must_match_exactly() {
        let auth = resolve_auth(Some("s3cret".into()));
        assert!(authorize(&auth, Some("Bearer s3cret")));
        assert!(!authorize(&auth, Some("Bearer wrong")));
        assert!(!authorize(&auth, Some("s3cret")));
        assert!(!authorize(&auth, None));
    }

    #[test]
    fn empty_token_means_disabled() {
        let auth = resolve_auth(Some(String::new()));
        assert!(!auth.enabled());
        assert!(authorize(&auth, None));
    }
}
