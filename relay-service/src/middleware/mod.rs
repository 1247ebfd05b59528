//! HTTP middleware

mod auth;

pub use auth::Authenticator;
