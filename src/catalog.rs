//! In-memory campaign catalog: campaign → step → action spec, refreshed
//! from a JSON endpoint.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One step of an IVR dialogue as the tenant configures it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    pub audio: String,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub dgts: Option<u32>,
    #[serde(default)]
    pub finish_on_key: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub timeout: u64,
}

pub type CampaignSteps = HashMap<String, ActionSpec>;

pub struct CampaignCatalog {
    url: Option<String>,
    client: reqwest::Client,
    campaigns: RwLock<HashMap<String, CampaignSteps>>,
}

impl CampaignCatalog {
    pub fn new(url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            url,
            client,
            campaigns: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, campaign: &str, step: &str) -> Option<ActionSpec> {
        self.campaigns
            .read()
            .ok()?
            .get(campaign)?
            .get(step)
            .cloned()
    }

    pub fn campaign(&self, campaign: &str) -> Option<CampaignSteps> {
        self.campaigns.read().ok()?.get(campaign).cloned()
    }

    /// A campaign drives two OTP rounds iff it carries a `gather1` step.
    pub fn is_two_gather(&self, campaign: &str) -> bool {
        self.campaigns
            .read()
            .map(|map| {
                map.get(campaign)
                    .map(|steps| steps.contains_key("gather1"))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> HashMap<String, CampaignSteps> {
        self.campaigns.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// Replace the whole catalog, returning how many campaigns it now holds.
    pub fn replace(&self, campaigns: HashMap<String, CampaignSteps>) -> usize {
        let len = campaigns.len();
        if let Ok(mut map) = self.campaigns.write() {
            *map = campaigns;
        }
        len
    }

    pub async fn reload(&self) -> Result<usize> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| Error::CatalogMiss("no catalog url configured".to_string()))?;
        let fetched: HashMap<String, CampaignSteps> = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("catalog fetch: {}", e)))?
            .json()
            .await?;
        let count = self.replace(fetched);
        info!(count, "campaign catalog reloaded");
        Ok(count)
    }

    pub async fn run_refresh(&self, every: Duration, cancel: CancellationToken) {
        loop {
            match self.reload().await {
                Ok(count) => info!(count, "catalog refresh"),
                Err(e) => warn!("catalog refresh failed: {}", e),
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

    fn sample() -> HashMap<String, CampaignSteps> {
        serde_json::from_value(serde_json::json!({
            "acme": {
                "answer": {"audio": "welcome", "next": "gather", "timeout": 6},
                "gather": {"audio": "enter-code", "dgts": 6, "timeout": 10},
                "gather1": {"audio": "enter-otp", "next": "confirm", "dgts": 1, "timeout": 10},
                "confirm": {"audio": "hold-on", "timeout": 20},
                "completed": {"audio": "goodbye", "timeout": 0}
            },
            "basic": {
                "answer": {"audio": "hello", "finishOnKey": "#", "timeout": 8}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_lookup_and_two_gather() {
        let catalog = CampaignCatalog::new(None);
        catalog.replace(sample());

        let spec = catalog.lookup("acme", "gather").unwrap();
        assert_eq!(spec.dgts, Some(6));
        assert!(catalog.lookup("acme", "missing").is_none());
        assert!(catalog.lookup("missing", "answer").is_none());

        assert!(catalog.is_two_gather("acme"));
        assert!(!catalog.is_two_gather("basic"));
        assert!(!catalog.is_two_gather("missing"));
    }

    #[test]
    fn test_finish_on_key_parses_camel_case() {
        let catalog = CampaignCatalog::new(None);
        catalog.replace(sample());
        let spec = catalog.lookup("basic", "answer").unwrap();
        assert_eq!(spec.finish_on_key.as_deref(), Some("#"));
    }
}
