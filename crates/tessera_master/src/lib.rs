use std::net::SocketAddr as EmbedSocketAddr;
use std::path::PathBuf as EmbedPathBuf;
use std::time::Duration as EmbedDuration;

include!("main.rs");

/// Minimal embeddable configuration for running a master inside another
/// process (tests, local mode, tooling).
#[derive(Clone, Debug)]
pub struct EmbeddedMasterConfig {
    pub bind: EmbedSocketAddr,
    pub root_dir: EmbedPathBuf,
    pub wake_interval: EmbedDuration,
    pub lease_duration: EmbedDuration,
    pub rescan_interval: EmbedDuration,
    pub max_region_open_time: EmbedDuration,
    pub num_retries: u32,
    pub drain_deadline: EmbedDuration,
    pub rpc_timeout: EmbedDuration,
    pub ready_timeout: EmbedDuration,
}

impl EmbeddedMasterConfig {
    /// Production-like defaults on an ephemeral port.
    pub fn new(root_dir: EmbedPathBuf) -> Self {
        Self {
            bind: "127.0.0.1:0".parse().expect("loopback address"),
            root_dir,
            wake_interval: EmbedDuration::from_secs(10),
            lease_duration: EmbedDuration::from_secs(30),
            rescan_interval: EmbedDuration::from_secs(60),
            max_region_open_time: EmbedDuration::from_secs(30),
            num_retries: 2,
            drain_deadline: EmbedDuration::from_secs(90),
            rpc_timeout: EmbedDuration::from_secs(10),
            ready_timeout: EmbedDuration::from_secs(20),
        }
    }

    /// Tight cadences so tests converge quickly.
    pub fn fast(root_dir: EmbedPathBuf) -> Self {
        Self {
            wake_interval: EmbedDuration::from_millis(25),
            lease_duration: EmbedDuration::from_millis(500),
            rescan_interval: EmbedDuration::from_millis(100),
            max_region_open_time: EmbedDuration::from_secs(5),
            num_retries: 5,
            drain_deadline: EmbedDuration::from_secs(2),
            rpc_timeout: EmbedDuration::from_secs(5),
            ..Self::new(root_dir)
        }
    }
}

#[derive(Debug)]
pub struct EmbeddedMasterHandle {
    address: EmbedSocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl EmbeddedMasterHandle {
    /// Address the embedded master is serving on.
    pub fn address(&self) -> EmbedSocketAddr {
        self.address
    }

    pub fn client(&self) -> transport::MasterClient {
        transport::MasterClient::new(self.address)
    }

    /// Signal shutdown and wait for the master task to drain and exit.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("master task join failed: {err}")),
        }
    }

    /// Wait for the master to exit on its own (e.g. after a client-driven
    /// shutdown request).
    pub async fn join(self) -> anyhow::Result<()> {
        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("master task join failed: {err}")),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Build `StartArgs` for an embedded master via the same CLI surface the
/// binary uses.
pub fn build_master_args(config: &EmbeddedMasterConfig) -> anyhow::Result<StartArgs> {
    let ms = |d: EmbedDuration| d.as_millis().max(1).to_string();
    let argv = vec![
        "tessera-master".to_string(),
        "--bind".to_string(),
        config.bind.to_string(),
        "--root-dir".to_string(),
        config.root_dir.display().to_string(),
        "--wake-interval-ms".to_string(),
        ms(config.wake_interval),
        "--lease-period-ms".to_string(),
        ms(config.lease_duration),
        "--rescan-interval-ms".to_string(),
        ms(config.rescan_interval),
        "--region-open-timeout-ms".to_string(),
        ms(config.max_region_open_time),
        "--retries".to_string(),
        config.num_retries.to_string(),
        "--drain-timeout-ms".to_string(),
        ms(config.drain_deadline),
        "--rpc-timeout-ms".to_string(),
        ms(config.rpc_timeout),
    ];
    StartArgs::try_parse_from(argv).map_err(|err| anyhow::anyhow!(err.to_string()))
}

/// Start an embedded master and wait until its listener answers.
pub async fn start_embedded_master(
    config: EmbeddedMasterConfig,
) -> anyhow::Result<EmbeddedMasterHandle> {
    let mut args = build_master_args(&config)?;
    // Resolve the (possibly ephemeral) listener address up front so the
    // handle can hand out clients.
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let address = listener.local_addr()?;
    drop(listener);
    args.bind = address;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        run_master_with_shutdown(args, async move {
            let _ = shutdown_rx.await;
            Ok::<(), std::io::Error>(())
        })
        .await
    });

    wait_for_listener(address, config.ready_timeout, &task).await?;

    Ok(EmbeddedMasterHandle {
        address,
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}

async fn wait_for_listener(
    addr: EmbedSocketAddr,
    timeout: EmbedDuration,
    task: &tokio::task::JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if task.is_finished() {
            return Err(anyhow::anyhow!(
                "embedded master exited before its listener became ready"
            ));
        }
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            return Err(anyhow::anyhow!(
                "timeout waiting for master listener on {addr}"
            ));
        }
        tokio::time::sleep(EmbedDuration::from_millis(25)).await;
    }
}
