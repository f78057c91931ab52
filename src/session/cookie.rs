/// Session cookie encoding and parsing
///
/// The `session` cookie holds `"<hashedToken>.<actingAdminIdOrEmpty>"`. It is
/// signed with the server cookie key, so a tampered value reads as missing.
use crate::error::{AppError, AppResult};
use axum_extra::extract::cookie::{Cookie, SameSite, SignedCookieJar};

pub const SESSION_COOKIE: &str = "session";

/// Length of a hex SHA-256 digest
const HASHED_TOKEN_LENGTH: usize = 64;

/// Decoded session cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSessionCookie {
    pub session_token: String,
    pub admin_user_id: Option<String>,
}

impl ParsedSessionCookie {
    pub fn encode(session_token: &str, admin_user_id: Option<&str>) -> String {
        format!("{}.{}", session_token, admin_user_id.unwrap_or(""))
    }

    /// Split on the first `.`; `None` when the token segment is malformed
    pub fn parse(value: &str) -> Option<Self> {
        let (token, admin) = value.split_once('.').unwrap_or((value, ""));

        let well_formed = token.len() == HASHED_TOKEN_LENGTH
            && token
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !well_formed {
            return None;
        }

        Some(ParsedSessionCookie {
            session_token: token.to_string(),
            admin_user_id: (!admin.is_empty()).then(|| admin.to_string()),
        })
    }
}

/// What to do with the cookie around a parse attempt
#[derive(Debug, Clone, Default)]
pub struct SessionCookieOptions {
    /// Remove the cookie when parsing failed
    pub delete_on_error: bool,
    /// Remove the cookie whatever the outcome
    pub delete_after_attempt: bool,
    /// Turn the failure into a browser redirect to this path
    pub redirect_path: Option<String>,
}

/// Build the session cookie
pub fn session_cookie(value: String, max_age: chrono::Duration, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, value))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(max_age.num_seconds()))
        .build()
}

/// Cookie that clears `name` in the browser
pub fn removal_cookie(name: impl Into<String>) -> Cookie<'static> {
    Cookie::build((name.into(), "")).path("/").build()
}

/// Read and decode the session cookie.
///
/// Missing, unsigned and malformed cookies all fail as `unauthorized`. The
/// returned jar carries any removal the options asked for.
pub fn get_parsed_session_cookie(
    jar: SignedCookieJar,
    options: &SessionCookieOptions,
) -> (SignedCookieJar, AppResult<ParsedSessionCookie>) {
    let result = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| ParsedSessionCookie::parse(cookie.value()))
        .ok_or_else(|| {
            let err = AppError::unauthorized();
            match &options.redirect_path {
                Some(path) => err.redirect_to(path.clone()),
                None => err,
            }
        });

    let remove = options.delete_after_attempt || (options.delete_on_error && result.is_err());
    let jar = if remove {
        jar.remove(removal_cookie(SESSION_COOKIE))
    } else {
        jar
    };

    (jar, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_token;
    use crate::error::ErrorType;
    use axum_extra::extract::cookie::Key;

    fn jar_with(value: Option<String>) -> SignedCookieJar {
        let jar = SignedCookieJar::new(Key::generate());
        match value {
            Some(v) => jar.add(session_cookie(v, chrono::Duration::hours(1), false)),
            None => jar,
        }
    }

    #[test]
    fn test_parse_without_admin() {
        let hashed = hash_token("raw");
        let parsed = ParsedSessionCookie::parse(&format!("{}.", hashed)).unwrap();
        assert_eq!(parsed.session_token, hashed);
        assert_eq!(parsed.admin_user_id, None);
    }

    #[test]
    fn test_parse_with_admin_splits_on_first_dot() {
        let hashed = hash_token("raw");
        let parsed = ParsedSessionCookie::parse(&format!("{}.admin.id", hashed)).unwrap();
        assert_eq!(parsed.admin_user_id.as_deref(), Some("admin.id"));
    }

    #[test]
    fn test_parse_rejects_malformed_token() {
        assert!(ParsedSessionCookie::parse("").is_none());
        assert!(ParsedSessionCookie::parse(".admin").is_none());
        assert!(ParsedSessionCookie::parse("not-a-hash.").is_none());
        assert!(ParsedSessionCookie::parse(&hash_token("x").to_uppercase()).is_none());
    }

    #[test]
    fn test_encode_round_trips() {
        let hashed = hash_token("raw");
        let encoded = ParsedSessionCookie::encode(&hashed, Some("admin1"));
        assert_eq!(encoded, format!("{}.admin1", hashed));
        assert_eq!(
            ParsedSessionCookie::parse(&encoded).unwrap().admin_user_id.as_deref(),
            Some("admin1")
        );
    }

    #[test]
    fn test_missing_cookie_is_unauthorized_and_kept_without_flags() {
        let (_, result) =
            get_parsed_session_cookie(jar_with(None), &SessionCookieOptions::default());
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorType::Unauthorized);
        assert!(!err.is_redirect);
    }

    #[test]
    fn test_redirect_option_marks_error() {
        let options = SessionCookieOptions {
            redirect_path: Some("/auth/sign-in".to_string()),
            ..Default::default()
        };
        let (_, result) = get_parsed_session_cookie(jar_with(Some("bad".to_string())), &options);
        let err = result.unwrap_err();
        assert!(err.is_redirect);
        assert_eq!(err.redirect_path.as_deref(), Some("/auth/sign-in"));
    }

    #[test]
    fn test_delete_on_error_only_removes_on_failure() {
        let options = SessionCookieOptions {
            delete_on_error: true,
            ..Default::default()
        };

        let good = ParsedSessionCookie::encode(&hash_token("raw"), None);
        let (jar, result) = get_parsed_session_cookie(jar_with(Some(good)), &options);
        assert!(result.is_ok());
        assert!(jar.get(SESSION_COOKIE).is_some());

        let (jar, result) = get_parsed_session_cookie(jar_with(Some("bad".to_string())), &options);
        assert!(result.is_err());
        assert!(jar.get(SESSION_COOKIE).is_none());
    }

    #[test]
    fn test_delete_after_attempt_always_removes() {
        let options = SessionCookieOptions {
            delete_after_attempt: true,
            ..Default::default()
        };

        let good = ParsedSessionCookie::encode(&hash_token("raw"), None);
        let (jar, result) = get_parsed_session_cookie(jar_with(Some(good)), &options);
        assert!(result.is_ok());
        assert!(jar.get(SESSION_COOKIE).is_none());
    }
}
