//! gRPC interceptors for cross-cutting concerns
//!
//! Interceptors provide similar functionality to HTTP middleware, allowing
//! request inspection and context installation before the handler runs. A
//! tonic interceptor applies uniformly to unary and streaming calls, and
//! request extensions reach the handler either way, so one interceptor
//! covers both shapes.

use std::sync::Arc;

use tonic::{metadata::MetadataMap, Request, Status};

use crate::auth::TokenVerifier;
use crate::context::{parse_language_list, RequestContext};

/// Authentication interceptor factory
///
/// Creates an interceptor that validates the bearer token from the
/// `authorization` metadata, pads internal-system claims from the lowercase
/// padding keys, and installs a [`RequestContext`] into the request
/// extensions. A request that already carries a context with claims (from a
/// previous interceptor) is passed through without re-authentication, as is
/// every request when the verifier is disabled.
///
/// # Example
/// ```ignore
/// use relay_service::grpc::authentication_interceptor;
/// use relay_service::auth::TokenVerifier;
/// use std::sync::Arc;
///
/// let verifier = Arc::new(TokenVerifier::from_config(&config.auth).await?);
/// let service = MyServiceServer::with_interceptor(
///     service_impl,
///     authentication_interceptor(verifier),
/// );
/// ```
pub fn authentication_interceptor(
    verifier: Arc<TokenVerifier>,
) -> impl Fn(Request<()>) -> Result<Request<()>, Status> + Clone {
    move |mut req: Request<()>| {
        let already_authenticated = req
            .extensions()
            .get::<RequestContext>()
            .map(|ctx| ctx.claims().is_some())
            .unwrap_or(false);
        if already_authenticated || !verifier.is_enabled() {
            return Ok(req);
        }

        let token = req
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| Status::unauthenticated("missing or invalid authorization token"))?;

        let mut claims = verifier
            .verify(&token)
            .map_err(|e| Status::unauthenticated(e.to_string()))?;

        if claims.is_internal_system() {
            let metadata = req.metadata();
            claims.pad_with(|key| {
                metadata
                    .get(key)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            });
        }

        tracing::debug!(
            sub = %claims.subject(),
            "gRPC request authenticated"
        );

        let languages = languages_from_metadata(req.metadata());
        let ctx = RequestContext::new()
            .with_claims(claims)
            .with_raw_jwt(token)
            .with_languages(languages);
        req.extensions_mut().insert(ctx);

        Ok(req)
    }
}

fn languages_from_metadata(metadata: &MetadataMap) -> Vec<String> {
    metadata
        .get("accept-language")
        .and_then(|v| v.to_str().ok())
        .map(parse_language_list)
        .unwrap_or_default()
}
