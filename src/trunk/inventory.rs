//! Periodic trunk-inventory fetch feeding the store.

use super::{Trunk, TrunkInventoryEntry, TrunkStore};
use crate::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct InventoryResponse {
    pub success: bool,
    #[serde(default)]
    pub trunks: HashMap<String, Vec<TrunkInventoryEntry>>,
}

pub struct InventoryFetcher {
    url: String,
    client: reqwest::Client,
    store: Arc<TrunkStore>,
}

impl InventoryFetcher {
    pub fn new(url: String, store: Arc<TrunkStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { url, client, store }
    }

    pub async fn fetch_once(&self) -> Result<usize> {
        let response: InventoryResponse =
            self.client.get(&self.url).send().await?.json().await?;
        let users_to_trunks: HashMap<String, Vec<Trunk>> = response
            .trunks
            .into_iter()
            .map(|(token, entries)| (token, entries.iter().map(Trunk::from).collect()))
            .collect();
        let count = users_to_trunks.values().map(|t| t.len()).sum();
        self.store.update_inventory(users_to_trunks);
        Ok(count)
    }

    pub async fn run(&self, every: Duration, cancel: CancellationToken) {
        loop {
            match self.fetch_once().await {
                Ok(count) => info!(count, "trunk inventory refreshed"),
                Err(e) => warn!("trunk inventory fetch failed: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(every) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_response_parses_comma_separated_phones() {
        let raw = serde_json::json!({
            "success": true,
            "trunks": {
                "user-1": [
                    {"sip_id": "custom_A", "sip_phone": "15550001111,15550002222", "sip_verified": true},
                    {"sip_id": "vendorx_B", "sip_phone": "15550003333"}
                ]
            }
        });
        let response: InventoryResponse = serde_json::from_value(raw).unwrap();
        assert!(response.success);

        let trunks: Vec<Trunk> = response.trunks["user-1"].iter().map(Trunk::from).collect();
        assert_eq!(trunks[0].phone_numbers.len(), 2);
        assert!(trunks[0].is_verified);
        assert!(!trunks[1].is_verified);
    }
}
