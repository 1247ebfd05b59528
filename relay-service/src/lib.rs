//! # relay-service
//!
//! Service-framework core: named pub/sub over pluggable broker drivers,
//! bounded by a cooperative worker pool, with per-request context (claims,
//! trace baggage, language preference) carried losslessly across HTTP, gRPC
//! and message hops.
//!
//! ## Features
//!
//! - **Named endpoints**: publishers and subscribers registered by reference
//!   on a [`QueueManager`](queue::QueueManager), initialized lazily or in one
//!   batch, recreated in place on transient broker failures
//! - **Bounded dispatch**: every subscriber submits handler jobs through one
//!   [`WorkerPool`](workers::WorkerPool), so pool capacity caps concurrent
//!   handling framework-wide
//! - **Context propagation**: authentication claims, tenancy bypass, trace
//!   context and language preference are flattened into message metadata on
//!   publish and reconstructed before handlers run
//! - **Ingress interceptors**: axum middleware and tonic interceptors verify
//!   bearer tokens against a JWKS document and install the request context
//! - **Drivers**: `mem://` (process-shared, in-memory) always; `nats://`
//!   behind the `nats` feature; `http(s)://` registers pull-mode endpoints
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_service::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let pool = WorkerPool::new(
//!         &config.worker_pool,
//!         Arc::new(|err| tracing::error!(error = %err, "shutting down")),
//!     );
//!     let manager = QueueManager::new(pool);
//!
//!     let ctx = RequestContext::new();
//!     manager.add_publisher(&ctx, "orders", "mem://orders").await?;
//!     manager
//!         .add_subscriber(
//!             &ctx,
//!             "orders-worker",
//!             "mem://orders",
//!             vec![worker_fn(|_ctx, _metadata, body| async move {
//!                 tracing::info!(bytes = body.len(), "order received");
//!                 Ok(())
//!             })],
//!         )
//!         .await?;
//!     manager.init(&ctx).await?;
//!
//!     manager.publish(&ctx, "orders", "order-1", &[]).await?;
//!     manager.close(&ctx).await
//! }
//! ```

pub mod auth;
pub mod claims;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod observability;
pub mod queue;
pub mod workers;

#[cfg(feature = "http")]
pub mod middleware;

#[cfg(feature = "grpc")]
pub mod grpc;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::auth::{register_oauth2_client, TokenVerifier};
    pub use crate::claims::AuthenticationClaims;
    pub use crate::codec::{Decode, Encode, Json};
    pub use crate::config::{
        Config, OAuth2RegistrationConfig, QueueConfig, QueueEndpointConfig, WorkerPoolConfig,
    };
    pub use crate::context::RequestContext;
    pub use crate::error::{Error, Result};
    pub use crate::observability::init_tracing;
    pub use crate::queue::{
        worker_fn, QueueManager, SubscribeWorker, Subscriber, SubscriberMetrics, SubscriberState,
    };
    pub use crate::workers::WorkerPool;

    #[cfg(feature = "http")]
    pub use crate::middleware::Authenticator;

    #[cfg(feature = "grpc")]
    pub use crate::grpc::authentication_interceptor;
}
