use actix_web::{test, web, App};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::{dispatch_rpc, handle_jsonrpc, AppState, Collaborators, Pipeline, PipelineConfig};
use chaincrawl_core::{
    ChainAdapter, ChainConfig, CrawlerConfig, MockAdapterBuilder, MockChainAdapter,
    ProcessorConfig,
};

async fn running_pipeline() -> (Pipeline, AppState, MockChainAdapter) {
    let eth = MockChainAdapter::new(ChainConfig::new("ethereum", "mock://eth").with_start_block(1));
    eth.add_blocks(1..=20);
    let builder = Arc::new(MockAdapterBuilder::new().with_adapter(eth.clone()));
    let config = PipelineConfig {
        crawler: CrawlerConfig {
            coordination_interval: Duration::from_millis(10),
            backoff_delay: Duration::from_millis(10),
            ..CrawlerConfig::with_concurrency(2)
        },
        processor: ProcessorConfig {
            retry_delay: Duration::from_millis(1),
            ..ProcessorConfig::default()
        },
        recovery_interval: Duration::from_secs(3600),
    };
    let collaborators = Collaborators::in_memory();
    let pipeline = Pipeline::start(config, vec![eth.config().clone()], builder, &collaborators)
        .await
        .unwrap();
    let state = AppState::new(&pipeline, &collaborators);
    (pipeline, state, eth)
}

async fn wait_for_block(state: &AppState, chain_id: &str, block: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = state.coordinator.status();
            if status.chain(chain_id).map_or(false, |c| c.processed_block >= block) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_status_reports_crawl_progress() {
    let (pipeline, state, _eth) = running_pipeline().await;
    wait_for_block(&state, "ethereum", 20).await;

    let status = dispatch_rpc(&state, "crawler_status", &[]).await.unwrap();
    assert_eq!(status["coordinator"]["chains"][0]["chain_id"], "ethereum");
    assert_eq!(status["coordinator"]["chains"][0]["processed_block"], 20);
    assert_eq!(status["coordinator"]["chains"][0]["status"], "synced");
    assert_eq!(status["parkedUpdates"], 0);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_wallet_registration_methods() {
    let (pipeline, state, _eth) = running_pipeline().await;
    let wallet = "0xABCDEF0000000000000000000000000000000001";

    let registered = dispatch_rpc(
        &state,
        "crawler_registerWallet",
        &[json!(wallet), json!("user-1")],
    )
    .await
    .unwrap();
    assert_eq!(registered, json!(true));

    let conflict = dispatch_rpc(
        &state,
        "crawler_registerWallet",
        &[json!(wallet), json!("user-2")],
    )
    .await;
    assert!(conflict.is_err());

    let active = dispatch_rpc(&state, "crawler_activeWallets", &[]).await.unwrap();
    assert_eq!(active[0]["address"], wallet.to_lowercase());
    assert_eq!(active[0]["user_id"], "user-1");

    let removed = dispatch_rpc(&state, "crawler_deregisterWallet", &[json!(wallet)])
        .await
        .unwrap();
    assert_eq!(removed, json!(true));
    let active = dispatch_rpc(&state, "crawler_activeWallets", &[]).await.unwrap();
    assert_eq!(active, json!([]));

    assert!(dispatch_rpc(&state, "crawler_registerWallet", &[json!(wallet)])
        .await
        .is_err());
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_resync_and_process_failed() {
    let (pipeline, state, _eth) = running_pipeline().await;
    wait_for_block(&state, "ethereum", 20).await;

    let resynced = dispatch_rpc(&state, "crawler_resync", &[json!("ethereum"), json!(15)])
        .await
        .unwrap();
    assert_eq!(resynced, json!(true));
    assert!(dispatch_rpc(&state, "crawler_resync", &[json!("solana")])
        .await
        .is_err());
    wait_for_block(&state, "ethereum", 20).await;

    let report = dispatch_rpc(&state, "crawler_processFailed", &[]).await.unwrap();
    assert_eq!(report["recovered"], 0);
    assert_eq!(report["buried"], 0);
    pipeline.shutdown().await;
}

#[actix_web::test]
async fn test_jsonrpc_envelope() {
    let (pipeline, state, _eth) = running_pipeline().await;
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .service(web::resource("/").route(web::post().to(handle_jsonrpc))),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/")
        .set_json(json!({"jsonrpc": "2.0", "id": 7, "method": "crawler_activeWallets", "params": []}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["id"], 7);
    assert_eq!(body["result"], json!([]));

    let req = test::TestRequest::post()
        .uri("/")
        .set_json(json!({"jsonrpc": "2.0", "id": 8, "method": "crawler_unknown"}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["error"]["code"], -32000);
    assert_eq!(body["error"]["message"], "Method not found");
    pipeline.shutdown().await;
}
