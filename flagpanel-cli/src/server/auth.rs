use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cookie::{Cookie, SameSite};
use flagpanel_lib::api::{ErrorBody, User};
use tracing::debug;

use super::config::AuthConfig;
use super::state::AppState;

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "fp_session";

/// Identity reported for requests authenticated by a static API token.
pub const API_TOKEN_USER: &str = "api-token";

/// Check a bearer token against the configured static API tokens.
pub fn check_api_token(config: &AuthConfig, token: Option<&str>) -> bool {
    let Some(token) = token else { return false };
    config.api_tokens.iter().any(|t| t == token)
}

/// Extract bearer token from Authorization header value.
pub fn extract_bearer_token(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ").map(str::trim)
}

/// Value of the session cookie, if the request carries one.
pub fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| Cookie::split_parse(v))
        .filter_map(Result::ok)
        .find(|c| c.name() == SESSION_COOKIE)
        .map(|c| c.value_trimmed().to_string())
        .filter(|value| !value.is_empty())
}

/// Bearer token first, then the session cookie.
pub fn request_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
        .map(str::to_string)
        .or_else(|| cookie_token(headers))
}

/// Who the request belongs to, if anyone.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<User> {
    let token = request_token(headers)?;
    if check_api_token(&state.config.auth, Some(&token)) {
        return Some(User {
            email: API_TOKEN_USER.to_string(),
        });
    }
    state.sessions.resolve(&token).await
}

/// Middleware guarding the flag routes. The resolved [`User`] is put into the
/// request extensions.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let user = authenticate(&state, request.headers()).await;
    match user {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => {
            debug!(path = %request.uri().path(), "rejecting unauthenticated request");
            unauthorized()
        }
    }
}

/// Cookie opening a session.
pub fn session_cookie(token: &str, max_age: Duration, secure: bool) -> Cookie<'static> {
    let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    Cookie::build((SESSION_COOKIE, token.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(cookie::time::Duration::seconds(max_age))
        .build()
}

/// Removal cookie for the session: empty value, zero max-age, expiry in the past.
pub fn clear_session_cookie(secure: bool) -> Cookie<'static> {
    let mut cookie = session_cookie("", Duration::ZERO, secure);
    cookie.make_removal();
    cookie
}

/// Return 401 Unauthorized response.
pub fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: "Unauthorized".to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn api_tokens_must_match_exactly() {
        let config = AuthConfig {
            api_tokens: vec!["secret".to_string()],
            ..AuthConfig::default()
        };
        assert!(check_api_token(&config, Some("secret")));
        assert!(!check_api_token(&config, Some("secret2")));
        assert!(!check_api_token(&config, None));
        assert!(!check_api_token(&AuthConfig::default(), Some("")));
    }

    #[test]
    fn bearer_header_wins_over_cookie() {
        let map = headers(&[
            ("authorization", "Bearer abc"),
            ("cookie", "fp_session=def"),
        ]);
        assert_eq!(request_token(&map).as_deref(), Some("abc"));

        let map = headers(&[("cookie", "theme=dark; fp_session=def; other=1")]);
        assert_eq!(request_token(&map).as_deref(), Some("def"));

        let map = headers(&[("authorization", "Basic abc"), ("cookie", "fp_session=")]);
        assert_eq!(request_token(&map), None);
    }

    #[test]
    fn cookie_values_are_unquoted_and_split_across_headers() {
        let map = headers(&[("cookie", "fp_session=\"abc\"")]);
        assert_eq!(cookie_token(&map).as_deref(), Some("abc"));

        let map = headers(&[("cookie", "theme=dark"), ("cookie", "fp_session=xyz")]);
        assert_eq!(cookie_token(&map).as_deref(), Some("xyz"));
    }

    #[test]
    fn session_cookie_attributes() {
        let header = session_cookie("tok", Duration::from_secs(60), true).to_string();
        let cookie = Cookie::parse(header).unwrap();
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.value(), "tok");
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::seconds(60)));
    }

    #[test]
    fn clearing_cookie_expires_it() {
        let header = clear_session_cookie(false).to_string();
        let cookie = Cookie::parse(header).unwrap();
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::ZERO));
        assert!(cookie.expires_datetime().is_some());
        assert_ne!(cookie.secure(), Some(true));
    }
}
