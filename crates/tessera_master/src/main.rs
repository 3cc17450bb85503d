// Tessera master binary entry point.
//
// Wires together the catalog bootstrap, the server and region managers, the
// operation queue, and the request listener. Also hosts the CLI and runtime
// configuration.

use std::collections::HashSet;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

pub mod catalog;
pub mod dfs;
pub mod error;
pub mod lease;
pub mod ops;
pub mod queue;
pub mod region_manager;
pub mod server_manager;
pub mod transport;

use catalog::{ColumnSpec, RegionDescriptor, TableSchema};
use dfs::{Dfs, LocalDfs};
use error::{MasterError, Result};
use lease::LeaseTracker;
use ops::{MutationCtx, Operation};
use queue::{OpSender, QueuedOperation};
use region_manager::RegionManager;
use server_manager::{
    ConfigSubset, ServerIdentity, ServerInstruction, ServerLoad, ServerManager,
    ServerStatusMessage,
};
use transport::{
    ClusterStatusSnapshot, ConnectionFactory, MasterClient, RegionInterface, TcpConnectionFactory,
};

/// Runtime configuration, resolved from CLI arguments.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub bind: SocketAddr,
    pub root_dir: PathBuf,
    /// Cadence of the control loop, lease checker, and blocking waits.
    pub wake_interval: Duration,
    pub lease_duration: Duration,
    pub rescan_interval: Duration,
    /// A region pending open longer than this is handed back for
    /// reassignment.
    pub max_region_open_time: Duration,
    /// Retry budget request handlers apply to recoverable failures.
    pub num_retries: u32,
    /// Overall bound on waiting for storage servers to report their own
    /// shutdown.
    pub drain_deadline: Duration,
    pub rpc_timeout: Duration,
}

/// Coordination state shared by the control loop, the request handlers, and
/// the background managers. The managers own their maps; everyone else gets
/// snapshots.
pub struct MasterState {
    pub config: MasterConfig,
    closed: AtomicBool,
    shutdown_requested: AtomicBool,
    fs_ok: AtomicBool,
    pub dfs: Arc<dyn Dfs>,
    connections: Arc<dyn ConnectionFactory>,
    pub server_manager: ServerManager,
    pub region_manager: RegionManager,
    ops: OpSender,
    /// Mutual-exclusion guard: table names with a creation in flight.
    tables_in_creation: Mutex<HashSet<String>>,
}

impl MasterState {
    /// Bootstrap the catalog and assemble the coordination state. The
    /// returned receiver feeds `queue::run_control_loop`.
    pub fn open(
        config: MasterConfig,
        dfs: Arc<dyn Dfs>,
        connections: Arc<dyn ConnectionFactory>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<QueuedOperation>)> {
        region_manager::bootstrap_catalog(dfs.as_ref())?;

        let (ops, rx) = OpSender::channel();
        let startup_config = ConfigSubset {
            catalog_root: config.root_dir.display().to_string(),
            filesystem_uri: dfs.uri(),
        };
        let server_manager = ServerManager::new(
            LeaseTracker::new(config.lease_duration),
            ops.clone(),
            startup_config,
            config.wake_interval,
        );
        let region_manager = RegionManager::new(
            config.rescan_interval,
            config.wake_interval,
            config.max_region_open_time,
        );
        // The root region is assigned afresh on every master start.
        region_manager.mark_unassigned(catalog::root_region_desc());

        let state = Arc::new(Self {
            config,
            closed: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            fs_ok: AtomicBool::new(true),
            dfs,
            connections,
            server_manager,
            region_manager,
            ops,
            tables_in_creation: Mutex::new(HashSet::new()),
        });
        tracing::info!(address = %state.config.bind, "master initialized");
        Ok((state, rx))
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.closed()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// The `shutdown()` surface: requests quiescence and returns. Never
    /// fails; the drain happens in the control loop and after it.
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            tracing::info!("cluster shutdown requested; quiescing storage servers");
        }
    }

    /// Stop accepting new work. Idempotent; also reached from the fatal
    /// error paths.
    pub fn start_shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("master closing");
            // Wake parked scanners and waiters so they observe the flag.
            self.region_manager.trigger_scan();
        }
    }

    /// Confirm the backing filesystem is still reachable; an unreachable
    /// filesystem is fatal for the whole cluster.
    pub fn check_filesystem(&self) -> bool {
        if self.fs_ok.load(Ordering::SeqCst) && !self.dfs.available() {
            tracing::error!("filesystem is unreachable; shutting down the cluster");
            self.fs_ok.store(false, Ordering::SeqCst);
            self.start_shutdown();
        }
        self.fs_ok.load(Ordering::SeqCst)
    }

    pub fn enqueue_op(&self, op: Operation) -> Result<()> {
        self.ops.enqueue(op)
    }

    pub fn connection(&self, addr: SocketAddr) -> Arc<dyn RegionInterface> {
        self.connections.connection(addr)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.closed() {
            return Err(MasterError::MasterNotRunning);
        }
        Ok(())
    }

    pub fn find_root_region(&self) -> Option<SocketAddr> {
        if self.shutdown_requested() || self.closed() {
            return None;
        }
        self.region_manager.root_location()
    }

    pub fn cluster_status(&self) -> ClusterStatusSnapshot {
        ClusterStatusSnapshot {
            running: self.is_running(),
            shutdown_requested: self.shutdown_requested(),
            root_location: self.region_manager.root_location(),
            online_meta_regions: self.region_manager.online_meta_count(),
            assigned_regions: self.region_manager.assignment_count(),
            unassigned_regions: self.region_manager.unassigned_count(),
            servers: self.server_manager.load_snapshot(),
        }
    }

    /// Create a table: guarded by the in-creation set, validated against
    /// the catalog, retried here (not by the queue) against the retry
    /// budget while the catalog comes online.
    pub async fn create_table(&self, schema: TableSchema) -> Result<()> {
        self.ensure_running()?;
        schema.validate()?;
        let desc = RegionDescriptor::new(schema, Vec::new(), Vec::new());
        let _guard = CreationGuard::acquire(self, desc.table.name.clone())?;

        let mut op = Operation::create_table(desc);
        let mut last_err = MasterError::CatalogUnavailable;
        for attempt in 0..=self.config.num_retries {
            if !self
                .region_manager
                .wait_for_meta_online_or_close(self)
                .await
            {
                return Err(MasterError::MasterNotRunning);
            }
            match op.process(self).await {
                Ok(_) => return Ok(()),
                Err(err) if !err.is_recoverable() => return Err(err),
                Err(err) => {
                    last_err = err;
                    if attempt < self.config.num_retries {
                        tokio::time::sleep(self.config.wake_interval).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    pub async fn delete_table(&self, table: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let ctx = MutationCtx::new(tx, self.config.num_retries);
        self.submit(Operation::delete_table(table, ctx), rx).await
    }

    pub async fn change_table_state(&self, table: String, enable: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let ctx = MutationCtx::new(tx, self.config.num_retries);
        self.submit(Operation::change_table_state(table, enable, ctx), rx)
            .await
    }

    pub async fn add_column(&self, table: String, spec: ColumnSpec) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let ctx = MutationCtx::new(tx, self.config.num_retries);
        self.submit(Operation::add_column(table, spec, ctx), rx)
            .await
    }

    pub async fn modify_column(
        &self,
        table: String,
        family: String,
        spec: ColumnSpec,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let ctx = MutationCtx::new(tx, self.config.num_retries);
        self.submit(Operation::modify_column(table, family, spec, ctx), rx)
            .await
    }

    pub async fn delete_column(&self, table: String, family: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let ctx = MutationCtx::new(tx, self.config.num_retries);
        self.submit(Operation::delete_column(table, family, ctx), rx)
            .await
    }

    /// Enqueue a schema mutation and wait for the control loop to finish
    /// it. A dropped completion means the queues were cleared at shutdown.
    async fn submit(&self, op: Operation, rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        self.ensure_running()?;
        self.enqueue_op(op)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(MasterError::MasterNotRunning),
        }
    }

    pub fn server_startup(
        &self,
        identity: ServerIdentity,
        load: ServerLoad,
    ) -> Result<ConfigSubset> {
        self.ensure_running()?;
        self.server_manager.startup(identity, load)
    }

    pub fn server_report(
        &self,
        identity: &ServerIdentity,
        load: ServerLoad,
        messages: Vec<ServerStatusMessage>,
    ) -> Result<Vec<ServerInstruction>> {
        self.server_manager.report(self, identity, load, messages)
    }
}

/// Holds a table name in the in-creation set; removed on every exit path.
struct CreationGuard<'a> {
    state: &'a MasterState,
    table: String,
}

impl<'a> CreationGuard<'a> {
    fn acquire(state: &'a MasterState, table: String) -> Result<Self> {
        let mut in_creation = state.tables_in_creation.lock().unwrap();
        if !in_creation.insert(table.clone()) {
            return Err(MasterError::TableExists(table));
        }
        Ok(Self { state, table })
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        self.state
            .tables_in_creation
            .lock()
            .unwrap()
            .remove(&self.table);
    }
}

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "tessera-master")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch the master.
    Start(StartArgs),
    /// Ask a running master to shut the cluster down.
    Stop(StopArgs),
}

#[derive(Parser, Debug)]
pub struct StartArgs {
    /// Address the master listens on.
    #[arg(long, default_value = "127.0.0.1:60000")]
    bind: SocketAddr,

    /// Filesystem root holding the catalog and region storage.
    #[arg(long)]
    root_dir: PathBuf,

    /// Run as an embedded single-process cluster.
    #[arg(long)]
    local: bool,

    #[arg(long, default_value_t = 10_000)]
    wake_interval_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    lease_period_ms: u64,

    #[arg(long, default_value_t = 60_000)]
    rescan_interval_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    region_open_timeout_ms: u64,

    #[arg(long, default_value_t = 2)]
    retries: u32,

    #[arg(long, default_value_t = 90_000)]
    drain_timeout_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    rpc_timeout_ms: u64,
}

impl StartArgs {
    pub fn config(&self) -> MasterConfig {
        // Clamp timeouts to at least 1ms to avoid zero-duration waits.
        let ms = |value: u64| Duration::from_millis(value.max(1));
        MasterConfig {
            bind: self.bind,
            root_dir: self.root_dir.clone(),
            wake_interval: ms(self.wake_interval_ms),
            lease_duration: ms(self.lease_period_ms),
            rescan_interval: ms(self.rescan_interval_ms),
            max_region_open_time: ms(self.region_open_timeout_ms),
            num_retries: self.retries,
            drain_deadline: ms(self.drain_timeout_ms),
            rpc_timeout: ms(self.rpc_timeout_ms),
        }
    }
}

#[derive(Parser, Debug)]
pub struct StopArgs {
    /// Address of the running master.
    #[arg(long, default_value = "127.0.0.1:60000")]
    master: SocketAddr,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Start(args) => run_master(args).await,
        Command::Stop(args) => stop_master(args).await,
    }
}

/// Run the master until interrupted.
pub async fn run_master(args: StartArgs) -> anyhow::Result<()> {
    run_master_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Bootstrap, start the service tasks, and run until the control loop exits
/// or `shutdown` resolves.
pub async fn run_master_with_shutdown<F>(args: StartArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    if args.local {
        tracing::info!("local mode: embedded single-process cluster");
    }
    let mut config = args.config();
    let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(&config.root_dir));
    let connections = Arc::new(TcpConnectionFactory::new(config.rpc_timeout));

    // Bootstrap before binding: a master that refuses to start (version
    // mismatch, unreachable root) must never look reachable.
    region_manager::bootstrap_catalog(dfs.as_ref()).map_err(|err| anyhow::anyhow!("{err}"))?;

    // Bind before building state so an ephemeral port is resolved into the
    // address handed to storage servers.
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    config.bind = listener.local_addr().context("listener address")?;

    let (state, op_rx) =
        MasterState::open(config, dfs, connections).map_err(|err| anyhow::anyhow!("{err}"))?;

    let listener_task = tokio::spawn({
        let state = state.clone();
        async move {
            if let Err(err) = transport::serve(listener, state).await {
                tracing::error!(error = %err, "master listener failed");
            }
        }
    });
    region_manager::spawn_scanners(state.clone());
    server_manager::spawn_expiry_checker(state.clone());
    let mut loop_task = tokio::spawn(queue::run_control_loop(state.clone(), op_rx));
    tracing::info!(address = %state.config.bind, root = %state.config.root_dir.display(), "master started");

    tokio::select! {
        res = &mut loop_task => {
            res.context("control loop task")?;
        }
        res = shutdown => {
            res.context("shutdown signal")?;
            tracing::info!("shutdown signal received");
            state.request_shutdown();
            loop_task.await.context("control loop task")?;
        }
    }

    // The loop has exited and the scanners observe the closed flag. Let the
    // storage servers report their own shutdown, then release the listener.
    state.server_manager.let_servers_shutdown(&state).await;
    listener_task.abort();
    tracing::info!("master exited");
    Ok(())
}

async fn stop_master(args: StopArgs) -> anyhow::Result<()> {
    let client = MasterClient::new(args.master);
    client
        .shutdown()
        .await
        .map_err(|err| anyhow::anyhow!("cannot stop master at {}: {err}", args.master))?;
    tracing::info!(master = %args.master, "shutdown requested");
    Ok(())
}
