use async_trait::async_trait;
use log::debug;
use tokio::sync::broadcast;

use chaincrawl_core::{CrawlResult, PubSub, UpdateChannel};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// In-process bus: one broadcast channel per update channel.
///
/// Publishing with no subscribers is not an error; the message is dropped.
pub struct MemPubSub {
    library: broadcast::Sender<String>,
    store: broadcast::Sender<String>,
}

impl MemPubSub {
    pub fn new(capacity: usize) -> Self {
        let (library, _) = broadcast::channel(capacity);
        let (store, _) = broadcast::channel(capacity);
        Self { library, store }
    }

    fn sender(&self, channel: UpdateChannel) -> &broadcast::Sender<String> {
        match channel {
            UpdateChannel::Library => &self.library,
            UpdateChannel::Store => &self.store,
        }
    }
}

impl Default for MemPubSub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl PubSub for MemPubSub {
    async fn publish(&self, channel: UpdateChannel, payload: String) -> CrawlResult<()> {
        if self.sender(channel).send(payload).is_err() {
            debug!("No subscribers on {}", channel.topic());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: UpdateChannel) -> CrawlResult<broadcast::Receiver<String>> {
        Ok(self.sender(channel).subscribe())
    }
}
