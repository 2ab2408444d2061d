//! Distributed lock integration tests.
//!
//! Several lock clients share one in-memory store, standing in for server
//! processes that share the remote store.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use helios_docstore::backends::{InMemoryDocumentClient, OperationKind};
use helios_docstore::error::{ConcurrencyError, StorageError};
use helios_docstore::layout::lock_document_id;
use helios_docstore::lock::DistributedLock;

use common::{fast_lock_config, memory_collection, retrying, with_collection};

#[tokio::test]
async fn test_one_holder_at_a_time() {
    let (client, link) = with_collection(
        InMemoryDocumentClient::new().with_latency(Duration::from_millis(1)),
    )
    .await;

    let inside = Arc::new(AtomicU32::new(0));
    let max_inside = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for holder in 0..4 {
        let lock = DistributedLock::with_holder_id(
            Arc::new(client.clone()),
            link.clone(),
            fast_lock_config(),
            format!("holder-{holder}"),
        );
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        handles.push(tokio::spawn(async move {
            let token = lock
                .acquire("critical", Duration::from_secs(30))
                .await
                .unwrap();
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            max_inside.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            let fencing_token = token.fencing_token();
            lock.release(token).await;
            fencing_token
        }));
    }

    let mut tokens = Vec::new();
    for handle in handles {
        tokens.push(handle.await.unwrap());
    }
    tokens.sort_unstable();

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(tokens, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let (client, link) = memory_collection().await;
    let first = DistributedLock::new(Arc::new(client.clone()), link.clone(), fast_lock_config());
    let second = DistributedLock::new(Arc::new(client.clone()), link.clone(), fast_lock_config());

    let mut stale = first.acquire("job", Duration::from_secs(10)).await.unwrap();
    assert!(
        second
            .try_acquire("job", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none()
    );

    client.advance_clock(Duration::from_secs(11));
    let fresh = second
        .try_acquire("job", Duration::from_secs(10))
        .await
        .unwrap()
        .expect("expired lease should be free");
    assert!(fresh.fencing_token() > stale.fencing_token());
    assert_eq!(fresh.holder_id(), second.holder_id());

    // The previous holder finds out on its next renewal.
    let err = first.renew(&mut stale).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::Concurrency(ConcurrencyError::LockLost { .. })
    ));
}

#[tokio::test]
async fn test_renewal_keeps_lock_past_original_lease() {
    let (client, link) = memory_collection().await;
    let holder = DistributedLock::new(Arc::new(client.clone()), link.clone(), fast_lock_config());
    let other = DistributedLock::new(Arc::new(client.clone()), link.clone(), fast_lock_config());

    let mut token = holder.acquire("job", Duration::from_secs(10)).await.unwrap();
    client.advance_clock(Duration::from_secs(8));
    holder.renew(&mut token).await.unwrap();
    client.advance_clock(Duration::from_secs(8));

    assert!(
        other
            .try_acquire("job", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_acquire_times_out_while_held() {
    let (client, link) = memory_collection().await;
    let mut config = fast_lock_config();
    config.acquire_timeout = Duration::from_millis(50);

    let holder = DistributedLock::new(Arc::new(client.clone()), link.clone(), config.clone());
    let waiter = DistributedLock::new(Arc::new(client), link, config);

    let _token = holder.acquire("job", Duration::from_secs(30)).await.unwrap();
    let err = waiter
        .acquire("job", Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::Concurrency(ConcurrencyError::LockTimeout { .. })
    ));
}

#[tokio::test]
async fn test_distinct_names_do_not_contend() {
    let (client, link) = memory_collection().await;
    let a = DistributedLock::new(Arc::new(client.clone()), link.clone(), fast_lock_config());
    let b = DistributedLock::new(Arc::new(client), link, fast_lock_config());

    let _upgrade = a.acquire("upgrade", Duration::from_secs(30)).await.unwrap();
    let submit = b
        .try_acquire("reindex-submit", Duration::from_secs(30))
        .await
        .unwrap();
    assert!(submit.is_some());
}

// ---------------------------------------------------------------------------
// Writes retried after a lost reply
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_replayed_create_still_acquires() {
    let (client, link) = memory_collection().await;
    client.lose_acknowledgement(OperationKind::CreateDocument, lock_document_id("upgrade"));

    let lock = DistributedLock::with_holder_id(retrying(&client), link.clone(), fast_lock_config(), "me");
    let token = lock.acquire("upgrade", Duration::from_secs(30)).await.unwrap();
    assert_eq!(token.fencing_token(), 1);
    assert_eq!(token.holder_id(), "me");

    // The token carries the stored ETag, so release frees the lock.
    lock.release(token).await;
    let other = DistributedLock::new(Arc::new(client), link, fast_lock_config());
    assert!(
        other
            .try_acquire("upgrade", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_replayed_takeover_still_acquires() {
    let (client, link) = memory_collection().await;
    let lock = DistributedLock::new(retrying(&client), link.clone(), fast_lock_config());
    let first = lock.acquire("job", Duration::from_secs(30)).await.unwrap();
    lock.release(first).await;

    client.lose_acknowledgement(OperationKind::ReplaceDocument, lock_document_id("job"));
    let second = lock.acquire("job", Duration::from_secs(30)).await.unwrap();
    assert_eq!(second.fencing_token(), 2);
}

#[tokio::test]
async fn test_replayed_renewal_keeps_lock() {
    let (client, link) = memory_collection().await;
    let holder = DistributedLock::new(retrying(&client), link.clone(), fast_lock_config());
    let other = DistributedLock::new(Arc::new(client.clone()), link, fast_lock_config());

    let mut token = holder.acquire("job", Duration::from_secs(10)).await.unwrap();
    client.advance_clock(Duration::from_secs(8));
    client.lose_acknowledgement(OperationKind::ReplaceDocument, lock_document_id("job"));
    holder.renew(&mut token).await.unwrap();

    client.advance_clock(Duration::from_secs(8));
    assert!(
        other
            .try_acquire("job", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none()
    );
    holder.renew(&mut token).await.unwrap();
}
