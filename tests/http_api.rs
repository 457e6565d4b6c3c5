use std::{net::SocketAddr, sync::Arc};

use fundflow::http::{router, AppState};
use fundflow_core::{AccountStore, Ledger};
use fundflow_memory::InMemoryStorage;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

async fn spawn_app() -> String {
    let storage = Arc::new(InMemoryStorage::new());
    let ledger = Arc::new(Ledger::new(AccountStore::new(storage)));
    let app = router(AppState::new(ledger, None));

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = axum::Server::try_bind(&addr)
        .unwrap()
        .serve(app.into_make_service());
    let local = server.local_addr();
    tokio::spawn(server);
    format!("http://{}", local)
}

async fn create_account(client: &Client, base: &str, name: &str, balance: i64) -> Value {
    let res = client
        .post(format!("{}/account", base))
        .json(&json!({ "name": name, "balance": balance }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

#[tokio::test]
async fn test_health() {
    let base = spawn_app().await;
    let res = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_transfer_round_trip() {
    let base = spawn_app().await;
    let client = Client::new();
    let a = create_account(&client, &base, "A", 100).await;
    let b = create_account(&client, &base, "B", 0).await;

    let res = client
        .post(format!("{}/transfer", base))
        .json(&json!({ "sender": a["id"], "receiver": b["id"], "amount": 30 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let record: Value = res.json().await.unwrap();
    assert_eq!(record["sender_id"], a["id"]);
    assert_eq!(record["receiver_id"], b["id"]);
    assert_eq!(record["amount"], "30");
    assert!(record["timestamp"].is_string());

    let res = client
        .get(format!("{}/account?id={}", base, a["id"]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let account: Value = res.json().await.unwrap();
    assert_eq!(account["balance"], "70");

    let transfers: Value = client
        .get(format!("{}/transfers", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(transfers.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_insufficient_balance_is_bad_request() {
    let base = spawn_app().await;
    let client = Client::new();
    let a = create_account(&client, &base, "A", 10).await;
    let b = create_account(&client, &base, "B", 0).await;

    let res = client
        .post(format!("{}/transfer", base))
        .json(&json!({ "sender": a["id"], "receiver": b["id"], "amount": 1000 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, json!({ "success": false, "error": "insufficient balance" }));
}

#[tokio::test]
async fn test_unknown_account_is_not_found() {
    let base = spawn_app().await;
    let client = Client::new();
    let a = create_account(&client, &base, "A", 10).await;

    let res = client
        .post(format!("{}/transfer", base))
        .json(&json!({ "sender": a["id"], "receiver": 999, "amount": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);

    let res = client
        .delete(format!("{}/account?id=999", base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_account_update_and_delete() {
    let base = spawn_app().await;
    let client = Client::new();
    let a = create_account(&client, &base, "A", 10).await;

    let res = client
        .put(format!("{}/account", base))
        .json(&json!({ "id": a["id"], "name": "renamed", "balance": 25 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let updated: Value = res.json().await.unwrap();
    assert_eq!(updated["name"], "renamed");
    assert_eq!(updated["balance"], "25");

    let res = client
        .put(format!("{}/account", base))
        .json(&json!({ "id": a["id"], "name": "renamed", "balance": -5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .delete(format!("{}/account?id={}", base, a["id"]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let accounts: Value = client
        .get(format!("{}/accounts", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(accounts, json!([]));
}

#[tokio::test]
async fn test_invalid_transfer_amount() {
    let base = spawn_app().await;
    let client = Client::new();
    let a = create_account(&client, &base, "A", 10).await;
    let b = create_account(&client, &base, "B", 0).await;

    let res = client
        .post(format!("{}/transfer", base))
        .json(&json!({ "sender": a["id"], "receiver": b["id"], "amount": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_metrics_disabled_without_recorder() {
    let base = spawn_app().await;
    let res = reqwest::get(format!("{}/metrics", base)).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
