pub mod http;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use astra_brain::{BrainConfig, BrainRouter, LlmClient};
use astra_core::config::AppConfig;
use astra_core::{EventBus, SqliteStore};
use astra_engine::{
    ApprovalGate, Capture, ComputerExecutor, DesktopBridge, Kernel, MicroAction, RunEngine,
};
use astra_persona::EpisodicStore;
use astra_skills::{MemorySaveSkill, SkillRegistry, StubFetcher, StubSearchClient, WebResearchSkill};

/// Placeholder bridge for hosts without a desktop bridge process; every
/// computer step fails fast instead of hanging.
pub struct UnconfiguredBridge;

#[async_trait]
impl DesktopBridge for UnconfiguredBridge {
    async fn capture(&self, _max_width: u32, _quality: u32) -> anyhow::Result<Capture> {
        anyhow::bail!("desktop bridge is not configured")
    }

    async fn act(&self, _action: &MicroAction, _w: u32, _h: u32) -> anyhow::Result<()> {
        anyhow::bail!("desktop bridge is not configured")
    }
}

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Kernel>,
    pub store: Arc<SqliteStore>,
    pub bus: EventBus,
    pub engine: Arc<RunEngine>,
    pub config: AppConfig,
    pub data_dir: PathBuf,
    pub runtime_passphrase: Arc<RwLock<Option<String>>>,
}

/// Wire the kernel from configuration. The search/fetch/bridge adapters
/// default to inert stubs; deployments inject real ones here.
pub fn build_state(config: AppConfig) -> astra_core::Result<AppState> {
    let data_dir = config.data_dir.clone();
    std::fs::create_dir_all(&data_dir)?;
    let store = Arc::new(SqliteStore::open(
        &data_dir.join("astra.sqlite3"),
        config.memory.max_content_chars,
    )?);
    let bus = EventBus::new(store.clone());

    let brain = Arc::new(BrainRouter::new(BrainConfig::from_env(), Some(bus.clone())));
    let llm: Arc<dyn LlmClient> = brain.clone();

    let episodic = Arc::new(EpisodicStore::open(
        &config.episodic.db_path,
        config.episodic.max_episodes,
    )?);

    let mut registry = SkillRegistry::new();
    registry.register(Arc::new(MemorySaveSkill));
    registry.register(Arc::new(WebResearchSkill::new(
        Arc::new(StubSearchClient),
        Arc::new(StubFetcher),
        llm.clone(),
    )));

    let gate = ApprovalGate::new(store.clone(), bus.clone());
    let executor = Arc::new(ComputerExecutor::new(
        Arc::new(UnconfiguredBridge),
        llm.clone(),
        store.clone(),
        bus.clone(),
        gate,
    ));
    let engine = Arc::new(RunEngine::new(
        store.clone(),
        bus.clone(),
        registry.clone(),
        executor,
        llm.clone(),
        data_dir.clone(),
    ));

    let kernel = Arc::new(Kernel {
        store: store.clone(),
        bus: bus.clone(),
        brain,
        llm,
        episodic,
        chat_config: config.chat.clone(),
        registry,
        engine: engine.clone(),
        base_dir: data_dir.clone(),
    });

    Ok(AppState {
        kernel,
        store,
        bus,
        engine,
        config,
        data_dir,
        runtime_passphrase: Arc::new(RwLock::new(None)),
    })
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    // Make sure the session token exists before the first client connects.
    let token =
        astra_core::auth::ensure_session_token(&state.store, &state.data_dir).await?;
    tracing::info!(
        "astra-server listening on {} (auth_mode={}, token file ready, token len={})",
        addr,
        state.config.auth_mode.as_str(),
        token.len()
    );

    let app = http::app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(())
}
