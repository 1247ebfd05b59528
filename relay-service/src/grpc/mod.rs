//! gRPC support

pub mod interceptors;

pub use interceptors::authentication_interceptor;
