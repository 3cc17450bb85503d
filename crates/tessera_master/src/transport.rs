//! Framed TCP transport: the master's inbound request surface, the outbound
//! region interface used against storage servers, and the typed client.
//!
//! Frames are length-delimited bincode messages. The listener is a thin
//! adapter: every request is translated into a call on the coordination
//! state and the result is sent straight back; no catalog mutation runs on
//! a connection handler.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::catalog::{CatalogMutation, CatalogRow, ColumnSpec, TableSchema};
use crate::error::{MasterError, Result};
use crate::server_manager::{
    ConfigSubset, ServerIdentity, ServerInstruction, ServerLoad, ServerStatusMessage,
};
use crate::MasterState;

/// Requests accepted by the master: the client/administration surface plus
/// the storage-server surface.
#[derive(Debug, Serialize, Deserialize)]
pub enum MasterRequest {
    CreateTable {
        schema: TableSchema,
    },
    DeleteTable {
        table: String,
    },
    EnableTable {
        table: String,
    },
    DisableTable {
        table: String,
    },
    AddColumn {
        table: String,
        spec: ColumnSpec,
    },
    ModifyColumn {
        table: String,
        family: String,
        spec: ColumnSpec,
    },
    DeleteColumn {
        table: String,
        family: String,
    },
    IsMasterRunning,
    Shutdown,
    FindRootRegion,
    ClusterStatus,
    ServerStartup {
        identity: ServerIdentity,
        load: ServerLoad,
    },
    ServerReport {
        identity: ServerIdentity,
        load: ServerLoad,
        messages: Vec<ServerStatusMessage>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum MasterResponse {
    Ok,
    Running(bool),
    RootRegion(Option<SocketAddr>),
    Status(ClusterStatusSnapshot),
    StartupConfig(ConfigSubset),
    Instructions(Vec<ServerInstruction>),
    Error(MasterError),
}

/// Read-only snapshot for monitoring and administration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatusSnapshot {
    pub running: bool,
    pub shutdown_requested: bool,
    pub root_location: Option<SocketAddr>,
    pub online_meta_regions: usize,
    pub assigned_regions: usize,
    pub unassigned_regions: usize,
    pub servers: Vec<(String, ServerLoad)>,
}

/// Catalog-region calls the master issues against a storage server.
#[derive(Debug, Serialize, Deserialize)]
pub enum RegionRequest {
    OpenScanner {
        region: Vec<u8>,
        start_row: Vec<u8>,
    },
    NextRow {
        scanner: u64,
    },
    CloseScanner {
        scanner: u64,
    },
    Mutate {
        region: Vec<u8>,
        mutation: CatalogMutation,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RegionResponse {
    Scanner(u64),
    Row(Option<CatalogRow>),
    Ok,
    Error(String),
}

pub type FramedStream<S> = Framed<S, LengthDelimitedCodec>;

pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> FramedStream<S> {
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub async fn send_message<T, S>(framed: &mut FramedStream<S>, message: &T) -> io::Result<()>
where
    T: Serialize,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = bincode::serialize(message)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    framed.send(Bytes::from(bytes)).await
}

pub async fn recv_message<T, S>(framed: &mut FramedStream<S>) -> io::Result<Option<T>>
where
    T: DeserializeOwned,
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(frame)) => bincode::deserialize(&frame)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
        Some(Err(err)) => Err(err),
        None => Ok(None),
    }
}

/// Serve the master request surface until the task is aborted. Connection
/// handlers only translate and enqueue; they never mutate the catalog
/// inline.
pub async fn serve(listener: TcpListener, state: Arc<MasterState>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, state).await {
                tracing::debug!(%peer, error = %err, "master connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, state: Arc<MasterState>) -> io::Result<()> {
    let mut framed = framed(socket);
    while let Some(request) = recv_message::<MasterRequest, _>(&mut framed).await? {
        let response = dispatch(&state, request).await;
        send_message(&mut framed, &response).await?;
    }
    Ok(())
}

async fn dispatch(state: &Arc<MasterState>, request: MasterRequest) -> MasterResponse {
    match request {
        MasterRequest::CreateTable { schema } => reply(state.create_table(schema).await),
        MasterRequest::DeleteTable { table } => reply(state.delete_table(table).await),
        MasterRequest::EnableTable { table } => reply(state.change_table_state(table, true).await),
        MasterRequest::DisableTable { table } => {
            reply(state.change_table_state(table, false).await)
        }
        MasterRequest::AddColumn { table, spec } => reply(state.add_column(table, spec).await),
        MasterRequest::ModifyColumn {
            table,
            family,
            spec,
        } => reply(state.modify_column(table, family, spec).await),
        MasterRequest::DeleteColumn { table, family } => {
            reply(state.delete_column(table, family).await)
        }
        MasterRequest::IsMasterRunning => MasterResponse::Running(state.is_running()),
        MasterRequest::Shutdown => {
            state.request_shutdown();
            MasterResponse::Ok
        }
        MasterRequest::FindRootRegion => MasterResponse::RootRegion(state.find_root_region()),
        MasterRequest::ClusterStatus => MasterResponse::Status(state.cluster_status()),
        MasterRequest::ServerStartup { identity, load } => {
            match state.server_startup(identity, load) {
                Ok(config) => MasterResponse::StartupConfig(config),
                Err(err) => MasterResponse::Error(err),
            }
        }
        MasterRequest::ServerReport {
            identity,
            load,
            messages,
        } => match state.server_report(&identity, load, messages) {
            Ok(instructions) => MasterResponse::Instructions(instructions),
            Err(err) => MasterResponse::Error(err),
        },
    }
}

fn reply(result: Result<()>) -> MasterResponse {
    match result {
        Ok(()) => MasterResponse::Ok,
        Err(err) => MasterResponse::Error(err),
    }
}

/// Outbound catalog calls against one storage server; the seam that keeps
/// the coordination logic testable without a network.
#[async_trait]
pub trait RegionInterface: Send + Sync {
    async fn open_scanner(&self, region: &[u8], start_row: &[u8]) -> Result<u64>;
    async fn next_row(&self, scanner: u64) -> Result<Option<CatalogRow>>;
    async fn close_scanner(&self, scanner: u64) -> Result<()>;
    async fn mutate(&self, region: &[u8], mutation: CatalogMutation) -> Result<()>;
}

pub trait ConnectionFactory: Send + Sync {
    fn connection(&self, addr: SocketAddr) -> Arc<dyn RegionInterface>;
}

/// TCP-backed region interface. Holds one connection and re-dials lazily
/// after any failure.
pub struct RegionServerClient {
    addr: SocketAddr,
    timeout: Duration,
    conn: tokio::sync::Mutex<Option<FramedStream<TcpStream>>>,
}

impl RegionServerClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    async fn call(&self, request: RegionRequest) -> Result<RegionResponse> {
        let mut guard = self.conn.lock().await;
        let result = self.call_inner(&mut guard, &request).await;
        if result.is_err() {
            // Next call re-dials instead of reusing a broken stream.
            *guard = None;
        }
        result
    }

    async fn call_inner(
        &self,
        guard: &mut Option<FramedStream<TcpStream>>,
        request: &RegionRequest,
    ) -> Result<RegionResponse> {
        let attempt = async {
            if guard.is_none() {
                let stream = TcpStream::connect(self.addr).await?;
                *guard = Some(framed(stream));
            }
            let framed = guard.as_mut().expect("connection just established");
            send_message(framed, request).await?;
            recv_message::<RegionResponse, _>(framed).await
        };
        let response = tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| {
                MasterError::RemoteCall(format!("call to storage server {} timed out", self.addr))
            })?
            .map_err(|err: io::Error| {
                MasterError::RemoteCall(format!("storage server {}: {err}", self.addr))
            })?;
        match response {
            Some(RegionResponse::Error(message)) => Err(MasterError::RemoteCall(format!(
                "storage server {}: {message}",
                self.addr
            ))),
            Some(response) => Ok(response),
            None => Err(MasterError::RemoteCall(format!(
                "storage server {} closed the connection",
                self.addr
            ))),
        }
    }
}

#[async_trait]
impl RegionInterface for RegionServerClient {
    async fn open_scanner(&self, region: &[u8], start_row: &[u8]) -> Result<u64> {
        match self
            .call(RegionRequest::OpenScanner {
                region: region.to_vec(),
                start_row: start_row.to_vec(),
            })
            .await?
        {
            RegionResponse::Scanner(id) => Ok(id),
            other => Err(unexpected(self.addr, &other)),
        }
    }

    async fn next_row(&self, scanner: u64) -> Result<Option<CatalogRow>> {
        match self.call(RegionRequest::NextRow { scanner }).await? {
            RegionResponse::Row(row) => Ok(row),
            other => Err(unexpected(self.addr, &other)),
        }
    }

    async fn close_scanner(&self, scanner: u64) -> Result<()> {
        match self.call(RegionRequest::CloseScanner { scanner }).await? {
            RegionResponse::Ok => Ok(()),
            other => Err(unexpected(self.addr, &other)),
        }
    }

    async fn mutate(&self, region: &[u8], mutation: CatalogMutation) -> Result<()> {
        match self
            .call(RegionRequest::Mutate {
                region: region.to_vec(),
                mutation,
            })
            .await?
        {
            RegionResponse::Ok => Ok(()),
            other => Err(unexpected(self.addr, &other)),
        }
    }
}

fn unexpected(addr: SocketAddr, response: &RegionResponse) -> MasterError {
    MasterError::RemoteCall(format!(
        "storage server {addr} sent an unexpected response: {response:?}"
    ))
}

/// Caching registry of region-server connections.
pub struct TcpConnectionFactory {
    timeout: Duration,
    cache: Mutex<HashMap<SocketAddr, Arc<RegionServerClient>>>,
}

impl TcpConnectionFactory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connection(&self, addr: SocketAddr) -> Arc<dyn RegionInterface> {
        self.cache
            .lock()
            .unwrap()
            .entry(addr)
            .or_insert_with(|| Arc::new(RegionServerClient::new(addr, self.timeout)))
            .clone()
    }
}

/// Typed client for the master request surface; used by administration, the
/// CLI `stop` path, and storage servers themselves.
#[derive(Debug, Clone)]
pub struct MasterClient {
    target: SocketAddr,
    timeout: Duration,
}

impl MasterClient {
    pub fn new(target: SocketAddr) -> Self {
        Self::with_timeout(target, Duration::from_secs(10))
    }

    pub fn with_timeout(target: SocketAddr, timeout: Duration) -> Self {
        Self {
            target,
            timeout: timeout.max(Duration::from_millis(1)),
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    async fn call(&self, request: MasterRequest) -> Result<MasterResponse> {
        let attempt = async {
            let stream = TcpStream::connect(self.target).await?;
            let mut framed = framed(stream);
            send_message(&mut framed, &request).await?;
            recv_message::<MasterResponse, _>(&mut framed).await
        };
        let response = tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| {
                MasterError::RemoteCall(format!("call to master {} timed out", self.target))
            })?
            .map_err(|err: io::Error| {
                MasterError::RemoteCall(format!("master {}: {err}", self.target))
            })?;
        match response {
            Some(MasterResponse::Error(err)) => Err(err),
            Some(response) => Ok(response),
            None => Err(MasterError::RemoteCall(format!(
                "master {} closed the connection",
                self.target
            ))),
        }
    }

    async fn call_unit(&self, request: MasterRequest) -> Result<()> {
        match self.call(request).await? {
            MasterResponse::Ok => Ok(()),
            other => Err(self.unexpected(&other)),
        }
    }

    fn unexpected(&self, response: &MasterResponse) -> MasterError {
        MasterError::RemoteCall(format!(
            "master {} sent an unexpected response: {response:?}",
            self.target
        ))
    }

    pub async fn create_table(&self, schema: TableSchema) -> Result<()> {
        self.call_unit(MasterRequest::CreateTable { schema }).await
    }

    pub async fn delete_table(&self, table: &str) -> Result<()> {
        self.call_unit(MasterRequest::DeleteTable {
            table: table.to_string(),
        })
        .await
    }

    pub async fn enable_table(&self, table: &str) -> Result<()> {
        self.call_unit(MasterRequest::EnableTable {
            table: table.to_string(),
        })
        .await
    }

    pub async fn disable_table(&self, table: &str) -> Result<()> {
        self.call_unit(MasterRequest::DisableTable {
            table: table.to_string(),
        })
        .await
    }

    pub async fn add_column(&self, table: &str, spec: ColumnSpec) -> Result<()> {
        self.call_unit(MasterRequest::AddColumn {
            table: table.to_string(),
            spec,
        })
        .await
    }

    pub async fn modify_column(&self, table: &str, family: &str, spec: ColumnSpec) -> Result<()> {
        self.call_unit(MasterRequest::ModifyColumn {
            table: table.to_string(),
            family: family.to_string(),
            spec,
        })
        .await
    }

    pub async fn delete_column(&self, table: &str, family: &str) -> Result<()> {
        self.call_unit(MasterRequest::DeleteColumn {
            table: table.to_string(),
            family: family.to_string(),
        })
        .await
    }

    pub async fn is_master_running(&self) -> Result<bool> {
        match self.call(MasterRequest::IsMasterRunning).await? {
            MasterResponse::Running(running) => Ok(running),
            other => Err(self.unexpected(&other)),
        }
    }

    /// Request quiescence. Never fails on a reachable master.
    pub async fn shutdown(&self) -> Result<()> {
        self.call_unit(MasterRequest::Shutdown).await
    }

    pub async fn find_root_region(&self) -> Result<Option<SocketAddr>> {
        match self.call(MasterRequest::FindRootRegion).await? {
            MasterResponse::RootRegion(addr) => Ok(addr),
            other => Err(self.unexpected(&other)),
        }
    }

    pub async fn cluster_status(&self) -> Result<ClusterStatusSnapshot> {
        match self.call(MasterRequest::ClusterStatus).await? {
            MasterResponse::Status(status) => Ok(status),
            other => Err(self.unexpected(&other)),
        }
    }

    pub async fn server_startup(
        &self,
        identity: ServerIdentity,
        load: ServerLoad,
    ) -> Result<ConfigSubset> {
        match self
            .call(MasterRequest::ServerStartup { identity, load })
            .await?
        {
            MasterResponse::StartupConfig(config) => Ok(config),
            other => Err(self.unexpected(&other)),
        }
    }

    pub async fn server_report(
        &self,
        identity: ServerIdentity,
        load: ServerLoad,
        messages: Vec<ServerStatusMessage>,
    ) -> Result<Vec<ServerInstruction>> {
        match self
            .call(MasterRequest::ServerReport {
                identity,
                load,
                messages,
            })
            .await?
        {
            MasterResponse::Instructions(instructions) => Ok(instructions),
            other => Err(self.unexpected(&other)),
        }
    }
}
