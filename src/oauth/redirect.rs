/// Post-login redirect validation
///
/// Only same-origin relative paths leave this module; anything else falls
/// back to the configured default path.

const MAX_REDIRECT_LENGTH: usize = 2048;

/// Accept a relative path starting with a single `/`.
///
/// Rejects protocol-relative paths (`//host`), backslashes (browsers treat
/// `/\host` like `//host`), schemes and control characters.
pub fn is_valid_redirect_path(path: &str) -> Option<&str> {
    if path.is_empty() || path.len() > MAX_REDIRECT_LENGTH {
        return None;
    }

    if !path.starts_with('/') || path.starts_with("//") {
        return None;
    }

    if path.contains('\\') || path.chars().any(char::is_control) {
        return None;
    }

    Some(path)
}

/// URL-decode the `redirect` query value and validate it, else use `default`
pub fn resolve_oauth_redirect(raw: Option<&str>, default: &str) -> String {
    raw.and_then(|value| urlencoding::decode(value).ok())
        .and_then(|decoded| is_valid_redirect_path(&decoded).map(str::to_string))
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_relative_paths() {
        assert_eq!(is_valid_redirect_path("/home"), Some("/home"));
        assert_eq!(
            is_valid_redirect_path("/organizations/acme?tab=members"),
            Some("/organizations/acme?tab=members")
        );
    }

    #[test]
    fn test_rejects_open_redirects() {
        for bad in [
            "javascript:alert(1)",
            "https://evil.com",
            "//evil.com",
            "/\\evil.com",
            "evil.com/path",
            "/home\r\nSet-Cookie: x=y",
            "",
        ] {
            assert_eq!(is_valid_redirect_path(bad), None, "{:?}", bad);
        }
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        assert_eq!(resolve_oauth_redirect(Some("javascript:alert(1)"), "/home"), "/home");
        assert_eq!(resolve_oauth_redirect(None, "/home"), "/home");
        assert_eq!(resolve_oauth_redirect(Some("%2F%2Fevil.com"), "/home"), "/home");
    }

    #[test]
    fn test_resolve_decodes_valid_paths() {
        assert_eq!(
            resolve_oauth_redirect(Some("%2Fsettings%2Fprofile"), "/home"),
            "/settings/profile"
        );
    }
}
