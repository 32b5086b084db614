#![cfg(target_arch = "wasm32")]

use std::sync::Arc;

use firestore_sync::firestore::core::{FirestoreClient, FirestoreSettings, Query};
use firestore_sync::firestore::remote::{EmptyCredentialsProvider, InMemoryConnection};
use firestore_sync::firestore::FirestoreErrorCode;
use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

async fn start_client() -> FirestoreClient {
    FirestoreClient::new(
        FirestoreSettings::default(),
        Arc::new(InMemoryConnection::new()),
        Arc::new(EmptyCredentialsProvider),
    )
    .await
    .expect("start client")
}

#[wasm_bindgen_test(async)]
async fn empty_cache_answers_queries() {
    let client = start_client().await;
    let snapshot = client
        .get_documents_from_local_cache(Query::collection("rooms").unwrap())
        .await
        .unwrap();
    assert!(snapshot.docs.is_empty());
    assert!(snapshot.from_cache);
    client.terminate().await.unwrap();
}

#[wasm_bindgen_test(async)]
async fn terminated_client_rejects_calls() {
    let client = start_client().await;
    client.terminate().await.unwrap();
    let err = client.disable_network().await.unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::Cancelled);
}
