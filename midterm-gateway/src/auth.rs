//! Cookie-presence auth gate for the two WebSocket upgrades. Validating
//! the cookie's contents belongs to the external auth collaborator
//! ("authentication/session-cookie layer" is out of scope);
//! the Gateway's only job is to refuse an upgrade that carries none.

use axum::http::HeaderMap;

/// Name of the session cookie the external auth collaborator sets.
/// Not specified by the distilled contract; `DESIGN.md` records this as
/// an Open Question resolution.
pub const SESSION_COOKIE_NAME: &str = "midterm_session";

/// Returns `true` if a non-empty `midterm_session` cookie is present in
/// the `Cookie` request header. The Gateway never inspects the value
/// beyond "is it non-empty" -- signature/expiry checks are the auth
/// collaborator's responsibility.
pub fn has_valid_session_cookie(headers: &HeaderMap) -> bool {
    let Some(raw) = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    raw.split(';').any(|pair| {
        let pair = pair.trim();
        match pair.split_once('=') {
            Some((name, value)) => name == SESSION_COOKIE_NAME && !value.is_empty(),
            None => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn missing_cookie_header_is_rejected() {
        assert!(!has_valid_session_cookie(&HeaderMap::new()));
    }

    #[test]
    fn empty_value_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::COOKIE, HeaderValue::from_static("midterm_session="));
        assert!(!has_valid_session_cookie(&headers));
    }

    #[test]
    fn present_cookie_among_others_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::COOKIE, HeaderValue::from_static("theme=dark; midterm_session=abc123; other=1"));
        assert!(has_valid_session_cookie(&headers));
    }
}
