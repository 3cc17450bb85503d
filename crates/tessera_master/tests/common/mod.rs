#![allow(dead_code)]

//! Shared helpers for integration tests: a scripted storage server that
//! registers with the master, heartbeats, serves catalog regions out of the
//! shared filesystem root, and applies the instructions it is handed.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};

use tessera_master::catalog::{unix_time_millis, CatalogRow, RegionDescriptor};
use tessera_master::dfs::LocalDfs;
use tessera_master::server_manager::{
    ServerIdentity, ServerInstruction, ServerLoad, ServerStatusMessage,
};
use tessera_master::transport::{
    framed, recv_message, send_message, MasterClient, RegionRequest, RegionResponse,
};

/// Heartbeat cadence of the scripted server.
pub const HEARTBEAT: Duration = Duration::from_millis(20);
/// Default deadline for convergence waits.
pub const CONVERGE: Duration = Duration::from_secs(30);

pub struct MockStorageServer {
    pub identity: ServerIdentity,
    inner: Arc<Inner>,
    listener_task: tokio::task::JoinHandle<()>,
    report_task: tokio::task::JoinHandle<()>,
}

struct Inner {
    dfs: LocalDfs,
    regions: Mutex<HashMap<Vec<u8>, BTreeMap<Vec<u8>, CatalogRow>>>,
    descriptors: Mutex<HashMap<Vec<u8>, RegionDescriptor>>,
    scanners: Mutex<HashMap<u64, Vec<CatalogRow>>>,
    next_scanner: AtomicU64,
    pending_status: Mutex<Vec<ServerStatusMessage>>,
    instructions_seen: Mutex<Vec<ServerInstruction>>,
    paused: AtomicBool,
    stopped: AtomicBool,
}

impl Inner {
    fn new(dfs: LocalDfs) -> Self {
        Self {
            dfs,
            regions: Mutex::new(HashMap::new()),
            descriptors: Mutex::new(HashMap::new()),
            scanners: Mutex::new(HashMap::new()),
            next_scanner: AtomicU64::new(1),
            pending_status: Mutex::new(Vec::new()),
            instructions_seen: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    fn open_region(&self, desc: RegionDescriptor) {
        let name = desc.region_name();
        let mut map = BTreeMap::new();
        for row in self.dfs.load_rows(&name).unwrap_or_default() {
            map.insert(row.row_key.clone(), row);
        }
        self.regions.lock().unwrap().insert(name.clone(), map);
        self.descriptors.lock().unwrap().insert(name, desc.clone());
        self.pending_status
            .lock()
            .unwrap()
            .push(ServerStatusMessage::RegionOpened(desc));
    }

    fn close_region(&self, desc: &RegionDescriptor) {
        let name = desc.region_name();
        let was_open = self.regions.lock().unwrap().remove(&name).is_some();
        self.descriptors.lock().unwrap().remove(&name);
        if was_open {
            self.pending_status
                .lock()
                .unwrap()
                .push(ServerStatusMessage::RegionClosed(desc.clone()));
        }
    }

    /// Close user regions, keep serving the catalog.
    fn quiesce(&self) {
        let user: Vec<RegionDescriptor> = self
            .descriptors
            .lock()
            .unwrap()
            .values()
            .filter(|desc| !desc.is_catalog())
            .cloned()
            .collect();
        for desc in user {
            self.close_region(&desc);
        }
        self.pending_status
            .lock()
            .unwrap()
            .push(ServerStatusMessage::Quiesced);
    }

    fn close_all(&self) {
        let all: Vec<RegionDescriptor> =
            self.descriptors.lock().unwrap().values().cloned().collect();
        for desc in all {
            self.close_region(&desc);
        }
    }

    fn persist(&self, region: &[u8], rows: &BTreeMap<Vec<u8>, CatalogRow>) {
        let rows: Vec<CatalogRow> = rows.values().cloned().collect();
        if let Err(err) = self.dfs.store_rows(region, &rows) {
            eprintln!("mock server failed to persist region rows: {err:#}");
        }
    }

    fn handle(&self, request: RegionRequest) -> RegionResponse {
        match request {
            RegionRequest::OpenScanner { region, start_row } => {
                let regions = self.regions.lock().unwrap();
                let Some(rows) = regions.get(&region) else {
                    return RegionResponse::Error("region not open".to_string());
                };
                let remaining: Vec<CatalogRow> =
                    rows.range(start_row..).map(|(_, row)| row.clone()).collect();
                let id = self.next_scanner.fetch_add(1, Ordering::SeqCst);
                self.scanners.lock().unwrap().insert(id, remaining);
                RegionResponse::Scanner(id)
            }
            RegionRequest::NextRow { scanner } => {
                let mut scanners = self.scanners.lock().unwrap();
                match scanners.get_mut(&scanner) {
                    Some(rows) if !rows.is_empty() => RegionResponse::Row(Some(rows.remove(0))),
                    Some(_) => RegionResponse::Row(None),
                    None => RegionResponse::Error("no such scanner".to_string()),
                }
            }
            RegionRequest::CloseScanner { scanner } => {
                self.scanners.lock().unwrap().remove(&scanner);
                RegionResponse::Ok
            }
            RegionRequest::Mutate { region, mutation } => {
                let mut regions = self.regions.lock().unwrap();
                let Some(rows) = regions.get_mut(&region) else {
                    return RegionResponse::Error("region not open".to_string());
                };
                if mutation.delete_row {
                    rows.remove(&mutation.row_key);
                } else {
                    let row = rows
                        .entry(mutation.row_key.clone())
                        .or_insert_with(|| CatalogRow::new(mutation.row_key.clone()));
                    for (column, value) in mutation.put {
                        row.cells.insert(column, value);
                    }
                    for column in mutation.delete {
                        row.cells.remove(&column);
                    }
                }
                self.persist(&region, rows);
                RegionResponse::Ok
            }
        }
    }
}

impl MockStorageServer {
    pub async fn start(master: SocketAddr) -> anyhow::Result<MockStorageServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let identity = ServerIdentity {
            name: addr.to_string(),
            address: addr,
            start_code: unix_time_millis(),
        };

        let client = MasterClient::new(master);
        let config = client
            .server_startup(identity.clone(), ServerLoad::default())
            .await?;
        let inner = Arc::new(Inner::new(LocalDfs::new(PathBuf::from(
            config.catalog_root,
        ))));

        let listener_task = tokio::spawn(region_service(listener, inner.clone()));
        let report_task = tokio::spawn(report_loop(client, identity.clone(), inner.clone()));

        Ok(MockStorageServer {
            identity,
            inner,
            listener_task,
            report_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.identity.address
    }

    /// Stop heartbeating, as if the process froze; the lease will expire.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// Kill the server abruptly: no exit report, no further responses.
    pub fn kill(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.listener_task.abort();
        self.report_task.abort();
    }

    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn hosts_root(&self) -> bool {
        self.inner
            .descriptors
            .lock()
            .unwrap()
            .values()
            .any(|desc| desc.is_root())
    }

    pub fn hosts_meta(&self) -> bool {
        self.inner
            .descriptors
            .lock()
            .unwrap()
            .values()
            .any(|desc| desc.is_meta())
    }

    pub fn hosts_table(&self, table: &str) -> bool {
        self.inner
            .descriptors
            .lock()
            .unwrap()
            .values()
            .any(|desc| desc.table.name == table)
    }

    pub fn open_region_count(&self) -> usize {
        self.inner.regions.lock().unwrap().len()
    }

    /// The catalog row for the first region of `table`, read from this
    /// server's open meta region, if it serves one.
    pub fn table_region_row(&self, table: &str) -> Option<CatalogRow> {
        let metas: Vec<Vec<u8>> = {
            let descriptors = self.inner.descriptors.lock().unwrap();
            descriptors
                .values()
                .filter(|desc| desc.is_meta())
                .map(|desc| desc.region_name())
                .collect()
        };
        let mut prefix = table.as_bytes().to_vec();
        prefix.push(b',');
        let regions = self.inner.regions.lock().unwrap();
        for meta in metas {
            if let Some(rows) = regions.get(&meta) {
                for (key, row) in rows.iter() {
                    if key.starts_with(&prefix) {
                        return Some(row.clone());
                    }
                }
            }
        }
        None
    }

    pub fn open_instructions_for(&self, table: &str) -> usize {
        self.inner
            .instructions_seen
            .lock()
            .unwrap()
            .iter()
            .filter(|instruction| {
                matches!(instruction, ServerInstruction::OpenRegion(desc) if desc.table.name == table)
            })
            .count()
    }

    pub fn saw_stop(&self) -> bool {
        self.inner
            .instructions_seen
            .lock()
            .unwrap()
            .iter()
            .any(|instruction| matches!(instruction, ServerInstruction::Stop))
    }
}

impl Drop for MockStorageServer {
    fn drop(&mut self) {
        self.listener_task.abort();
        self.report_task.abort();
    }
}

async fn report_loop(client: MasterClient, identity: ServerIdentity, inner: Arc<Inner>) {
    loop {
        tokio::time::sleep(HEARTBEAT).await;
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
        if inner.paused.load(Ordering::SeqCst) {
            continue;
        }
        let messages: Vec<ServerStatusMessage> =
            inner.pending_status.lock().unwrap().drain(..).collect();
        let load = ServerLoad {
            regions: inner.regions.lock().unwrap().len() as u32,
            requests: 0,
        };
        let Ok(instructions) = client
            .server_report(identity.clone(), load, messages)
            .await
        else {
            continue;
        };

        let mut stop = false;
        for instruction in instructions {
            inner
                .instructions_seen
                .lock()
                .unwrap()
                .push(instruction.clone());
            match instruction {
                ServerInstruction::OpenRegion(desc) => inner.open_region(desc),
                ServerInstruction::CloseRegion { region, .. } => inner.close_region(&region),
                ServerInstruction::Quiesce => inner.quiesce(),
                ServerInstruction::Stop => stop = true,
            }
        }
        if stop {
            inner.close_all();
            let _ = client
                .server_report(
                    identity.clone(),
                    ServerLoad::default(),
                    vec![ServerStatusMessage::Exiting],
                )
                .await;
            inner.stopped.store(true, Ordering::SeqCst);
            break;
        }
    }
}

async fn region_service(listener: TcpListener, inner: Arc<Inner>) {
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            break;
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            let _ = handle_region_conn(socket, inner).await;
        });
    }
}

async fn handle_region_conn(socket: TcpStream, inner: Arc<Inner>) -> io::Result<()> {
    let mut framed = framed(socket);
    while let Some(request) = recv_message::<RegionRequest, _>(&mut framed).await? {
        let response = inner.handle(request);
        send_message(&mut framed, &response).await?;
    }
    Ok(())
}

/// Poll `predicate` until it holds or the deadline passes.
pub async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, predicate: F) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Poll an async `predicate` until it holds or the deadline passes.
pub async fn wait_for_async<F, Fut>(what: &str, timeout: Duration, predicate: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}
