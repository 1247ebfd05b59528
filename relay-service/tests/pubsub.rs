//! End-to-end pub/sub scenarios over the in-memory driver

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_service::claims::AuthenticationClaims;
use relay_service::config::WorkerPoolConfig;
use relay_service::context::RequestContext;
use relay_service::queue::{memory, worker_fn, QueueManager};
use relay_service::workers::WorkerPool;

fn manager() -> QueueManager {
    let pool = WorkerPool::new(
        &WorkerPoolConfig {
            cpu_factor: 1,
            capacity: 8,
            count: 2,
            expiry_secs: 1,
        },
        Arc::new(|err| panic!("unexpected fatal error: {err}")),
    );
    QueueManager::new(pool)
}

async fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

#[tokio::test]
async fn unregistered_publish_fails() {
    let manager = manager();
    let ctx = RequestContext::new();

    let err = manager
        .publish(&ctx, "random", &Vec::<u8>::new(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "publisher random not found");
}

#[tokio::test]
async fn register_and_publish() {
    let url = "mem://e2e-register-and-publish";
    let manager = manager();
    let ctx = RequestContext::new();

    manager.add_publisher(&ctx, "test", url).await.unwrap();
    manager.publish(&ctx, "test", "msg", &[]).await.unwrap();

    let message = memory::last_message(url).expect("message observed on the subject");
    assert_eq!(message.body, b"msg");

    // No claims, language or tenancy keys without an authenticated context;
    // trace baggage is all the envelope may carry
    for key in [
        "sub",
        "tenant_id",
        "partition_id",
        "access_id",
        "contact_id",
        "device_id",
        "roles",
        "lang",
        "skip_tenancy",
    ] {
        assert!(
            !message.metadata.contains_key(key),
            "unexpected reserved key {key}"
        );
    }
}

#[tokio::test]
async fn subscriber_receives_published_messages() {
    let url = "mem://e2e-three-messages";
    let manager = manager();
    let ctx = RequestContext::new();

    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_in_handler = invocations.clone();

    manager.add_publisher(&ctx, "pub", url).await.unwrap();
    manager
        .add_subscriber(
            &ctx,
            "sub",
            url,
            vec![worker_fn(move |_ctx, _metadata, _body| {
                let invocations = invocations_in_handler.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })],
        )
        .await
        .unwrap();
    manager.init(&ctx).await.unwrap();

    for body in ["message1", "message2", "message3"] {
        manager.publish(&ctx, "pub", body, &[]).await.unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(2), || invocations
            .load(Ordering::SeqCst)
            == 3)
        .await,
        "handler invoked {} times within 2s, expected 3",
        invocations.load(Ordering::SeqCst)
    );

    manager.close(&ctx).await.unwrap();
}

#[tokio::test]
async fn claims_propagate_through_pubsub() {
    let url = "mem://e2e-claims";
    let manager = manager();

    let (observed_tx, mut observed_rx) = tokio::sync::mpsc::unbounded_channel();

    let registration_ctx = RequestContext::new();
    manager
        .add_publisher(&registration_ctx, "pub", url)
        .await
        .unwrap();
    manager
        .add_subscriber(
            &registration_ctx,
            "sub",
            url,
            vec![worker_fn(move |ctx, metadata, _body| {
                let observed_tx = observed_tx.clone();
                async move {
                    let claims = ctx.claims().cloned();
                    let _ = observed_tx.send((
                        metadata.get("tenant_id").cloned(),
                        claims,
                        ctx.skip_tenancy(),
                    ));
                    Ok(())
                }
            })],
        )
        .await
        .unwrap();
    manager.init(&registration_ctx).await.unwrap();

    let publish_ctx = RequestContext::new().with_claims(AuthenticationClaims {
        tenant_id: "T".to_string(),
        roles: vec!["system_internal_x".to_string()],
        ..Default::default()
    });
    manager
        .publish(&publish_ctx, "pub", "payload", &[])
        .await
        .unwrap();

    let (tenant, claims, skip_tenancy) =
        tokio::time::timeout(Duration::from_secs(2), observed_rx.recv())
            .await
            .expect("handler ran within 2s")
            .expect("observation recorded");

    assert_eq!(tenant.as_deref(), Some("T"));
    let claims = claims.expect("claims reconstructed from metadata");
    assert_eq!(claims.tenant_id(), "T");
    assert!(claims.is_internal_system());
    assert!(skip_tenancy);

    manager.close(&registration_ctx).await.unwrap();
}

#[tokio::test]
async fn language_round_trip() {
    let url = "mem://e2e-language";
    let manager = manager();
    let registration_ctx = RequestContext::new();

    let (observed_tx, mut observed_rx) = tokio::sync::mpsc::unbounded_channel();

    manager
        .add_publisher(&registration_ctx, "pub", url)
        .await
        .unwrap();
    manager
        .add_subscriber(
            &registration_ctx,
            "sub",
            url,
            vec![worker_fn(move |ctx, _metadata, _body| {
                let observed_tx = observed_tx.clone();
                async move {
                    let _ = observed_tx.send(ctx.languages().to_vec());
                    Ok(())
                }
            })],
        )
        .await
        .unwrap();
    manager.init(&registration_ctx).await.unwrap();

    let publish_ctx =
        RequestContext::new().with_languages(vec!["en".to_string(), "sw".to_string()]);
    manager
        .publish(&publish_ctx, "pub", "payload", &[])
        .await
        .unwrap();

    let languages = tokio::time::timeout(Duration::from_secs(2), observed_rx.recv())
        .await
        .expect("handler ran within 2s")
        .expect("observation recorded");
    assert_eq!(languages, vec!["en", "sw"]);

    manager.close(&registration_ctx).await.unwrap();
}

#[tokio::test]
async fn handler_error_nacks_without_crashing() {
    let url = "mem://e2e-handler-error";
    let manager = manager();
    let ctx = RequestContext::new();

    manager.add_publisher(&ctx, "pub", url).await.unwrap();
    manager
        .add_subscriber(
            &ctx,
            "sub",
            url,
            vec![worker_fn(|_ctx, _metadata, _body| async {
                Err(relay_service::error::Error::Handler(
                    "always fails".to_string(),
                ))
            })],
        )
        .await
        .unwrap();
    manager.init(&ctx).await.unwrap();

    manager.publish(&ctx, "pub", "payload", &[]).await.unwrap();

    let subscriber = manager.subscriber("sub").unwrap();
    let metrics = subscriber.metrics().clone();
    assert!(
        wait_until(Duration::from_secs(2), || metrics.error_count() == 1).await,
        "handler error not counted"
    );
    assert_eq!(memory::subject_stats(url).unwrap().nacked, 1);
    assert_eq!(metrics.error_count(), 1);
    assert!(subscriber.is_initiated());
    assert!(
        wait_until(Duration::from_secs(1), || {
            subscriber.state() == relay_service::queue::SubscriberState::Waiting
        })
        .await,
        "subscriber did not return to waiting"
    );

    manager.close(&ctx).await.unwrap();
}
