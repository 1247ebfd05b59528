//! Token verification and OAuth2 client self-registration

mod registration;
mod verifier;

pub use registration::register_oauth2_client;
pub use verifier::TokenVerifier;
