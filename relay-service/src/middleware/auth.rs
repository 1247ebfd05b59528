//! HTTP authentication middleware
//!
//! Verifies the bearer token, installs the resulting [`RequestContext`] into
//! the request extensions, pads internal-system claims from the padding
//! headers, and captures the caller's language preference. Downstream
//! handlers read the context back out of the extensions.
//!
//! Failure policy: missing `Authorization` header replies 403, a non-Bearer
//! header 400, a token that fails verification 401, all with plain-text
//! bodies. A disabled verifier passes every request through untouched.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::auth::TokenVerifier;
use crate::context::{parse_language_list, RequestContext};

/// HTTP authentication middleware state
#[derive(Clone)]
pub struct Authenticator {
    verifier: Arc<TokenVerifier>,
}

impl Authenticator {
    /// Create the middleware state around a verifier.
    pub fn new(verifier: Arc<TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Middleware function to authenticate the request and install the
    /// context.
    ///
    /// Wire with `axum::middleware::from_fn_with_state(authenticator,
    /// Authenticator::middleware)`.
    pub async fn middleware(
        State(auth): State<Self>,
        mut request: Request,
        next: Next,
    ) -> Response {
        if !auth.verifier.is_enabled() {
            return next.run(request).await;
        }

        let Some(value) = request.headers().get(header::AUTHORIZATION) else {
            return (StatusCode::FORBIDDEN, "authorization header is required").into_response();
        };
        let token = match value.to_str().ok().and_then(|v| v.strip_prefix("Bearer ")) {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => {
                return (
                    StatusCode::BAD_REQUEST,
                    "authorization header must use the Bearer scheme",
                )
                    .into_response()
            }
        };

        let mut claims = match auth.verifier.verify(&token) {
            Ok(claims) => claims,
            Err(err) => return (StatusCode::UNAUTHORIZED, err.to_string()).into_response(),
        };

        // The only legitimate post-verification mutation of claims: header
        // padding, before the value is installed into the context
        if claims.is_internal_system() {
            let headers = request.headers();
            claims.pad_with(|key| {
                headers
                    .get(key)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            });
        }

        let languages = languages_from_request(request.headers(), request.uri().query());

        let ctx = RequestContext::new()
            .with_claims(claims)
            .with_raw_jwt(token)
            .with_languages(languages);
        request.extensions_mut().insert(ctx);

        next.run(request).await
    }
}

/// Language preference for a request: `Accept-Language` tags in order, with
/// a `lang` query value (if any) prepended.
fn languages_from_request(headers: &HeaderMap, query: Option<&str>) -> Vec<String> {
    let mut languages = Vec::new();

    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "lang" && !value.is_empty() {
                languages.push(value.into_owned());
            }
        }
    }

    if let Some(accept) = headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
    {
        languages.extend(parse_language_list(accept));
    }

    languages
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_languages_from_accept_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en,sw;q=0.9"),
        );
        assert_eq!(languages_from_request(&headers, None), vec!["en", "sw"]);
    }

    #[test]
    fn test_lang_query_value_is_prepended() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        assert_eq!(
            languages_from_request(&headers, Some("lang=sw&x=1")),
            vec!["sw", "en"]
        );
    }

    #[test]
    fn test_no_language_information_yields_empty() {
        assert!(languages_from_request(&HeaderMap::new(), None).is_empty());
    }

    #[test]
    fn test_padding_headers_resolve_case_insensitively() {
        // The wire form is title-case; HeaderMap lookups are not
        let mut headers = HeaderMap::new();
        headers.insert("Tenant_id", HeaderValue::from_static("T-9"));
        assert_eq!(
            headers.get("tenant_id").and_then(|v| v.to_str().ok()),
            Some("T-9")
        );
    }
}
