use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use storage_element::config::{Config, LogFormat, ReplicaMode};
use storage_element::election::{Election, ElectionState, RoleHooks};
use storage_element::gc::Gc;
use storage_element::http_server::{build_router, AppState};
use storage_element::mode::load_mode_file;
use storage_element::refresh::RefreshLoop;

#[derive(Parser, Debug)]
#[command(name = "storage-element")]
#[command(about = "Storage Element - byte custodian of the distributed file-storage platform", long_about = None)]
struct CliArgs {
    /// Listener port (8010-8019); overrides SE_PORT
    #[arg(long)]
    port: Option<u16>,

    /// Data directory; overrides SE_DATA_DIR
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// WAL directory; overrides SE_WAL_DIR
    #[arg(long)]
    wal_dir: Option<PathBuf>,

    /// Initial storage mode (edit, rw, ro, ar); overrides SE_MODE
    #[arg(long)]
    mode: Option<String>,

    /// standalone or replicated; overrides SE_REPLICA_MODE
    #[arg(long)]
    replica_mode: Option<String>,

    /// host:port peers use to reach this node; overrides SE_ADVERTISE_ADDR
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides SE_LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,
}

impl CliArgs {
    /// CLI flags win over the environment by seeding it before the
    /// config parse.
    fn export_to_env(&self) {
        if let Some(port) = self.port {
            std::env::set_var("SE_PORT", port.to_string());
        }
        if let Some(dir) = &self.data_dir {
            std::env::set_var("SE_DATA_DIR", dir);
        }
        if let Some(dir) = &self.wal_dir {
            std::env::set_var("SE_WAL_DIR", dir);
        }
        if let Some(mode) = &self.mode {
            std::env::set_var("SE_MODE", mode);
        }
        if let Some(mode) = &self.replica_mode {
            std::env::set_var("SE_REPLICA_MODE", mode);
        }
        if let Some(addr) = &self.advertise_addr {
            std::env::set_var("SE_ADVERTISE_ADDR", addr);
        }
        if let Some(level) = &self.log_level {
            std::env::set_var("SE_LOG_LEVEL", level);
        }
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("storage_element={0},tower_http={0}", config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
    }
}

/// Owns the cancellation tokens of the role-dependent loops. Role changes
/// drop the old token (stopping those tasks) and spawn the new set.
struct RoleTasks {
    state: Arc<AppState>,
    slots: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    leader: Option<CancellationToken>,
    follower: Option<CancellationToken>,
}

impl RoleTasks {
    fn new(state: Arc<AppState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            slots: Mutex::new(Slots::default()),
        })
    }

    /// GC + reconciler; the leader also re-reads the published mode file
    /// once so a node promoted mid-life converges immediately.
    fn start_leader_duties(&self) {
        let mut slots = self.slots.lock().expect("task slots poisoned");
        if let Some(token) = slots.follower.take() {
            token.cancel();
        }
        if slots.leader.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        slots.leader = Some(cancel.clone());

        let state = self.state.clone();
        let service = state.service.clone();
        let gc = Gc::new(
            service.file_store().clone(),
            service.attr_store().clone(),
            service.wal(),
            service.index(),
            state.metrics.clone(),
            state.config.gc_interval,
        );
        tokio::spawn(gc.run(cancel.clone()));
        tokio::spawn(state.reconciler.clone().run(cancel.clone()));

        if state.config.replica_mode == ReplicaMode::Replicated {
            let fsm = service.fsm();
            let mode_file = state.config.mode_file_path();
            tokio::spawn(async move {
                match load_mode_file(&mode_file).await {
                    Ok(Some(data)) => {
                        fsm.force_mode(data.mode, &data.updated_by);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(%e, "leader failed to load shared mode file"),
                }
            });
        }
        info!("leader duties started (gc, reconciler)");
    }

    fn start_follower_duties(&self) {
        let mut slots = self.slots.lock().expect("task slots poisoned");
        if let Some(token) = slots.leader.take() {
            token.cancel();
        }
        if slots.follower.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        slots.follower = Some(cancel.clone());

        let state = self.state.clone();
        let service = state.service.clone();
        let refresh = RefreshLoop::new(
            service.attr_store().clone(),
            service.index(),
            service.fsm(),
            state.config.mode_file_path(),
            state.metrics.clone(),
            state.config.index_refresh_interval,
        );
        tokio::spawn(refresh.run(cancel));
        info!("follower duties started (index refresh)");
    }

    fn stop_follower_duties(&self) {
        let mut slots = self.slots.lock().expect("task slots poisoned");
        if let Some(token) = slots.follower.take() {
            token.cancel();
        }
    }

    fn stop_leader_duties(&self) {
        let mut slots = self.slots.lock().expect("task slots poisoned");
        if let Some(token) = slots.leader.take() {
            token.cancel();
        }
    }
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    args.export_to_env();

    let config = Arc::new(Config::from_env().context("invalid configuration")?);
    init_tracing(&config);

    info!(
        storage_id = %config.storage_id,
        port = config.port,
        data_dir = %config.data_dir.display(),
        wal_dir = %config.wal_dir.display(),
        mode = %config.mode,
        replica = ?config.replica_mode,
        "starting storage element"
    );
    if let Some(jwks) = &config.jwks_url {
        info!(jwks_url = %jwks, leeway_secs = config.jwt_leeway.as_secs(), "token verification delegated to gateway");
    }

    let election_state = match config.replica_mode {
        ReplicaMode::Standalone => ElectionState::standalone(),
        ReplicaMode::Replicated => ElectionState::new(storage_element::election::Role::Follower),
    };

    let state = AppState::initialize(config.clone(), election_state.clone())
        .await
        .context("startup failed")?;

    let tasks = RoleTasks::new(state.clone());
    let shutdown = CancellationToken::new();
    let election_cancel = CancellationToken::new();

    let election = match config.replica_mode {
        ReplicaMode::Standalone => {
            // No peers: this node always holds leader duties.
            tasks.start_leader_duties();
            None
        }
        ReplicaMode::Replicated => {
            let on_leader = {
                let tasks = tasks.clone();
                Box::new(move || tasks.start_leader_duties()) as Box<dyn Fn() + Send + Sync>
            };
            let on_follower = {
                let tasks = tasks.clone();
                Box::new(move || tasks.start_follower_duties()) as Box<dyn Fn() + Send + Sync>
            };
            let election = Election::with_state(
                config.data_dir.clone(),
                config.advertise_addr.clone(),
                config.election_retry_interval,
                election_state.clone(),
                RoleHooks {
                    on_become_leader: on_leader,
                    on_become_follower: on_follower,
                },
            );
            tokio::spawn(election.clone().run(election_cancel.clone()));
            Some(election)
        }
    };

    let router = build_router(state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    tokio::spawn(shutdown_signal(shutdown.clone()));

    let drain = {
        let shutdown = shutdown.clone();
        let state = state.clone();
        async move {
            shutdown.cancelled().await;
            state
                .shutting_down
                .store(true, std::sync::atomic::Ordering::SeqCst);
            info!("shutdown requested, draining in-flight requests");
        }
    };

    let serve = async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(drain)
            .await
    };
    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!(%e, "server error");
            }
        }
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(config.shutdown_timeout).await;
        } => {
            warn!(timeout = ?config.shutdown_timeout, "drain timed out, forcing shutdown");
        }
    }

    // Teardown order: refresh first, then the leader loops, then the
    // lock so a peer can take over.
    tasks.stop_follower_duties();
    tasks.stop_leader_duties();
    election_cancel.cancel();
    if let Some(election) = election {
        election.release();
    }
    info!("storage element stopped");
    Ok(())
}
