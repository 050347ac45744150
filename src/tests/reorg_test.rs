//! Chain reorganizations seen through the full pipeline.

use anyhow::Result;
use tokio::sync::broadcast;

use super::*;
use chaincrawl_core::{CoordinatorEvent, ZERO_ADDRESS};

async fn next_reorg(
    events: &mut broadcast::Receiver<CoordinatorEvent>,
) -> Result<(u64, u64)> {
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(CoordinatorEvent::ReorgDetected {
                    block_number,
                    rollback_to,
                    ..
                }) => return Some((block_number, rollback_to)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await?;
    found.ok_or_else(|| anyhow::anyhow!("event stream closed before a reorg"))
}

#[tokio::test]
async fn test_fork_rolls_back_to_common_ancestor() -> Result<()> {
    let chain = mock_chain("ethereum");
    chain.add_blocks(1..=8);
    chain.add_block_with_logs(9, vec![("0xe9", vec![transfer(ZERO_ADDRESS, ALICE, 4, "0xe9", 9)?])]);
    chain.add_blocks(10..=10);

    let scenario = Scenario::builder()
        .chain(chain.clone())
        .wallet(ALICE, "alice")
        .start()
        .await?;
    let mut events = scenario.pipeline.coordinator.subscribe();
    scenario.wait_for_block("ethereum", 10).await?;

    chain.fork_from(8);
    chain.add_blocks(11..=11);

    let (block, rollback_to) = next_reorg(&mut events).await?;
    assert_eq!(block, 11);
    assert_eq!(rollback_to, 7);

    scenario.wait_for_block("ethereum", 11).await?;
    let status = scenario.pipeline.coordinator.status();
    let eth = status
        .chain("ethereum")
        .ok_or_else(|| anyhow::anyhow!("no ethereum status"))?;
    assert_eq!(eth.error, None);

    // block 9 was crawled twice, once per fork
    assert_eq!(scenario.storage.total_supply("ethereum", CONTRACT).await, 1);
    assert_eq!(scenario.storage.balance_of("ethereum", CONTRACT, ALICE).await, 1);
    assert_eq!(scenario.storage.transaction_count().await, 1);

    scenario.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_fork_deeper_than_threshold_halts_chain() -> Result<()> {
    let chain = mock_chain("polygon");
    chain.add_blocks(1..=10);

    let mut config = fast_config();
    config.crawler.reorg_threshold = 2;
    let scenario = Scenario::builder()
        .chain(chain.clone())
        .config(config)
        .start()
        .await?;
    let mut events = scenario.pipeline.coordinator.subscribe();
    scenario.wait_for_block("polygon", 10).await?;

    chain.fork_from(2);
    chain.add_blocks(11..=11);

    let halted = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(CoordinatorEvent::ChainHalted { chain_id, .. }) => return Some(chain_id),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await?;
    assert_eq!(halted.as_deref(), Some("polygon"));

    let coordinator = scenario.pipeline.coordinator.clone();
    wait_until("halted status", || {
        let coordinator = coordinator.clone();
        async move {
            coordinator
                .status()
                .chain("polygon")
                .map_or(false, |c| c.error.is_some())
        }
    })
    .await?;

    scenario.shutdown().await;
    Ok(())
}
