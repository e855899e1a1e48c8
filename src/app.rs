use crate::call::{CallStore, OriginationQueue};
use crate::catalog::CampaignCatalog;
use crate::channel::{CallLifecycle, ChannelRegistry};
use crate::config::Config;
use crate::engine::ActionEngine;
use crate::handler;
use crate::pbx::{AriClient, PbxClient, PbxEventDemux};
use crate::push::PushRegistry;
use crate::trunk::inventory::InventoryFetcher;
use crate::trunk::TrunkStore;
use anyhow::{anyhow, Result};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub trunks: Arc<TrunkStore>,
    pub calls: Arc<CallStore>,
    pub queue: Arc<OriginationQueue>,
    pub push: Arc<PushRegistry>,
    pub registry: Arc<ChannelRegistry>,
    pub catalog: Arc<CampaignCatalog>,
    pub engine: Arc<ActionEngine>,
    pub pbx: Arc<dyn PbxClient>,
    pub http: reqwest::Client,
}

pub struct AppBuilder {
    config: Option<Config>,
    pbx: Option<Arc<dyn PbxClient>>,
}

pub struct App {
    pub state: AppState,
    pub cancel: CancellationToken,
    demux_ws_url: Option<String>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            pbx: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Inject a PBX client; mainly a seam for tests.
    pub fn pbx(mut self, pbx: Arc<dyn PbxClient>) -> Self {
        self.pbx = Some(pbx);
        self
    }

    pub fn build(self) -> Result<App> {
        let config = Arc::new(self.config.unwrap_or_default());

        let mut demux_ws_url = None;
        let pbx: Arc<dyn PbxClient> = match self.pbx {
            Some(pbx) => pbx,
            None => {
                let host = config
                    .pbx_host
                    .as_deref()
                    .ok_or_else(|| anyhow!("pbx host not configured"))?;
                let client = AriClient::new(host);
                demux_ws_url = Some(client.ws_url().to_string());
                Arc::new(client)
            }
        };

        let catalog = Arc::new(CampaignCatalog::new(config.catalog_url.clone()));
        let calls = Arc::new(CallStore::new());
        let push = Arc::new(PushRegistry::new());
        let engine = Arc::new(ActionEngine::new(
            catalog.clone(),
            calls.clone(),
            push.clone(),
            config.action_base_url.clone(),
        ));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let state = AppState {
            config,
            trunks: Arc::new(TrunkStore::new()),
            calls,
            queue: Arc::new(OriginationQueue::new()),
            push,
            registry: Arc::new(ChannelRegistry::new()),
            catalog,
            engine,
            pbx,
            http,
        };
        Ok(App {
            state,
            cancel: CancellationToken::new(),
            demux_ws_url,
        })
    }
}

impl App {
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        handler::router().with_state(self.state.clone()).layer(cors)
    }

    fn spawn_background(&self) {
        let state = &self.state;

        let lifecycle = Arc::new(CallLifecycle {
            registry: state.registry.clone(),
            calls: state.calls.clone(),
            push: state.push.clone(),
            pbx: state.pbx.clone(),
            catalog: state.catalog.clone(),
            action_base_url: state.config.action_base_url.clone(),
        });
        if let Some(ws_url) = self.demux_ws_url.clone() {
            let demux = Arc::new(PbxEventDemux::new(ws_url, lifecycle));
            let cancel = self.cancel.clone();
            tokio::spawn(async move { demux.run(cancel).await });
        }

        let calls = state.calls.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { calls.run_sweeper(cancel).await });

        if state.config.catalog_url.is_some() {
            let catalog = state.catalog.clone();
            let every = Duration::from_secs(state.config.catalog_refresh_secs);
            let cancel = self.cancel.clone();
            tokio::spawn(async move { catalog.run_refresh(every, cancel).await });
        }

        if let Some(url) = state.config.trunk_inventory_url.clone() {
            let fetcher = InventoryFetcher::new(url, state.trunks.clone());
            let every = Duration::from_secs(state.config.trunk_refresh_secs);
            let cancel = self.cancel.clone();
            tokio::spawn(async move { fetcher.run(every, cancel).await });
        }
    }

    pub async fn run(self) -> Result<()> {
        self.spawn_background();

        let addr: SocketAddr = self.state.config.http_addr().parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow!("failed to bind {}: {}", addr, e))?;
        info!(
            pbx = self.state.config.pbx_host.as_deref().unwrap_or(""),
            action_base_url = self.state.config.action_base_url,
            %addr,
            "dialflow listening"
        );

        let cancel = self.cancel.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        self.state.push.shutdown();
        info!("server shut down");
        Ok(())
    }
}
