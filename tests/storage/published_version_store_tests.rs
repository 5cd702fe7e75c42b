//! PublishedVersionStore interface tests.
//!
//! A cursor is keyed by (processor name, aggregate type, aggregate id), starts
//! at 0, and never moves backwards.

use causeway::interfaces::PublishedVersionStore;

const ACCOUNT: &str = "BankAccount";

// =============================================================================
// PublishedVersionStore::get tests
// =============================================================================

pub async fn test_get_unknown_is_zero<S: PublishedVersionStore>(store: &S) {
    let version = store
        .get("test_unknown", ACCOUNT, "acc-unknown")
        .await
        .expect("get should succeed");
    assert_eq!(version, 0, "unknown cursor should start at 0");
}

// =============================================================================
// PublishedVersionStore::update tests
// =============================================================================

pub async fn test_update_and_get<S: PublishedVersionStore>(store: &S) {
    let processor = "test_update_get";

    store
        .update(processor, ACCOUNT, "acc-1", 1)
        .await
        .expect("update should succeed");

    let version = store.get(processor, ACCOUNT, "acc-1").await.unwrap();
    assert_eq!(version, 1);
}

pub async fn test_update_advances<S: PublishedVersionStore>(store: &S) {
    let processor = "test_update_advance";

    for version in 1..=5 {
        store.update(processor, ACCOUNT, "acc-1", version).await.unwrap();
    }

    assert_eq!(store.get(processor, ACCOUNT, "acc-1").await.unwrap(), 5);
}

pub async fn test_update_never_regresses<S: PublishedVersionStore>(store: &S) {
    let processor = "test_update_regress";

    store.update(processor, ACCOUNT, "acc-1", 7).await.unwrap();
    store.update(processor, ACCOUNT, "acc-1", 3).await.unwrap();

    assert_eq!(
        store.get(processor, ACCOUNT, "acc-1").await.unwrap(),
        7,
        "a stale update must not move the cursor back"
    );
}

// =============================================================================
// Isolation tests
// =============================================================================

pub async fn test_processor_isolation<S: PublishedVersionStore>(store: &S) {
    store.update("test_iso_a", ACCOUNT, "acc-1", 4).await.unwrap();
    store.update("test_iso_b", ACCOUNT, "acc-1", 2).await.unwrap();

    assert_eq!(store.get("test_iso_a", ACCOUNT, "acc-1").await.unwrap(), 4);
    assert_eq!(store.get("test_iso_b", ACCOUNT, "acc-1").await.unwrap(), 2);
}

pub async fn test_aggregate_type_isolation<S: PublishedVersionStore>(store: &S) {
    let processor = "test_iso_type";

    store.update(processor, ACCOUNT, "shared-id", 3).await.unwrap();

    assert_eq!(
        store
            .get(processor, "TransferTransaction", "shared-id")
            .await
            .unwrap(),
        0
    );
}

pub async fn test_aggregate_id_isolation<S: PublishedVersionStore>(store: &S) {
    let processor = "test_iso_id";

    store.update(processor, ACCOUNT, "acc-1", 9).await.unwrap();

    assert_eq!(store.get(processor, ACCOUNT, "acc-2").await.unwrap(), 0);
}

#[macro_export]
macro_rules! run_published_version_store_tests {
    ($store:expr) => {
        use $crate::storage::published_version_store_tests::*;

        test_get_unknown_is_zero($store).await;
        println!("  test_get_unknown_is_zero: PASSED");

        test_update_and_get($store).await;
        println!("  test_update_and_get: PASSED");

        test_update_advances($store).await;
        println!("  test_update_advances: PASSED");

        test_update_never_regresses($store).await;
        println!("  test_update_never_regresses: PASSED");

        test_processor_isolation($store).await;
        println!("  test_processor_isolation: PASSED");

        test_aggregate_type_isolation($store).await;
        println!("  test_aggregate_type_isolation: PASSED");

        test_aggregate_id_isolation($store).await;
        println!("  test_aggregate_id_isolation: PASSED");
    };
}
