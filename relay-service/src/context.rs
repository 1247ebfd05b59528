//! Per-request context carried through ingress and pub/sub hops
//!
//! Rust has no ambient request context, so the framework passes an explicit
//! [`RequestContext`] value: four typed slots (claims, raw token, tenancy
//! bypass, language preference) plus a cancellation token. Transports attach
//! it to their request extensions; the queue subsystem reconstructs it from
//! message metadata on the consuming side.
//!
//! Slots are private. Reads go through typed accessors that return `None`
//! when a slot is unset; they never panic.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::claims::AuthenticationClaims;

/// Immutable per-request state
///
/// Cheap to clone: claims are shared behind an `Arc`, and clones share the
/// same cancellation token so a cancelled parent cancels every derived use.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    claims: Option<Arc<AuthenticationClaims>>,
    raw_jwt: Option<Arc<str>>,
    skip_tenancy: bool,
    languages: Vec<String>,
    cancellation: CancellationToken,
}

impl RequestContext {
    /// Create an empty context with a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context governed by an existing cancellation token.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: token,
            ..Self::default()
        }
    }

    /// Install claims.
    ///
    /// Internal-system claims imply tenancy scoping is skipped, so the flag
    /// is derived here rather than left to every call site.
    pub fn with_claims(mut self, claims: AuthenticationClaims) -> Self {
        if claims.is_internal_system() {
            self.skip_tenancy = true;
        }
        self.claims = Some(Arc::new(claims));
        self
    }

    /// Claims installed by the ingress path, if any.
    pub fn claims(&self) -> Option<&Arc<AuthenticationClaims>> {
        self.claims.as_ref()
    }

    /// Install the raw bearer token the claims were verified from.
    pub fn with_raw_jwt(mut self, token: impl Into<Arc<str>>) -> Self {
        self.raw_jwt = Some(token.into());
        self
    }

    /// Raw bearer token, if the ingress path kept one.
    pub fn raw_jwt(&self) -> Option<&str> {
        self.raw_jwt.as_deref()
    }

    /// Explicitly set the tenancy-bypass flag.
    pub fn with_skip_tenancy(mut self, skip: bool) -> Self {
        self.skip_tenancy = skip;
        self
    }

    /// Whether tenancy scoping is bypassed for this request.
    pub fn skip_tenancy(&self) -> bool {
        self.skip_tenancy
    }

    /// Install the caller's ordered language preference.
    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }

    /// Ordered language preference; empty means unspecified.
    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    /// Cancellation token governing blocking calls made with this context.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Derive a child context: shared slots, child cancellation token.
    ///
    /// Cancelling the parent cancels the child; cancelling the child leaves
    /// the parent running.
    pub fn child(&self) -> Self {
        Self {
            claims: self.claims.clone(),
            raw_jwt: self.raw_jwt.clone(),
            skip_tenancy: self.skip_tenancy,
            languages: self.languages.clone(),
            cancellation: self.cancellation.child_token(),
        }
    }
}

/// Split a comma-separated language list, dropping quality weights.
///
/// `"en-GB, sw;q=0.8"` becomes `["en-GB", "sw"]`; order is preserved.
pub(crate) fn parse_language_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|part| part.split(';').next().unwrap_or("").trim())
        .filter(|tag| !tag.is_empty())
        .map(String::from)
        .collect()
}
