//! Storage-server liveness tracking and heartbeat processing.
//!
//! Every connected storage server holds one lease, renewed by its periodic
//! status report. Reports carry region lifecycle messages inbound and take
//! open/close/quiesce instructions back outbound. The server manager never
//! blocks on recovery work itself; everything that takes time is handed to
//! the operation queue.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::catalog::RegionDescriptor;
use crate::error::{MasterError, Result};
use crate::lease::{LeaseTracker, Renewal};
use crate::ops::Operation;
use crate::queue::OpSender;
use crate::region_manager::CloseKind;
use crate::MasterState;

/// Stable identity of one storage-server incarnation. A restarted process
/// carries a fresh start code, so it never collides with the record being
/// recovered for its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// host:port the server answers catalog calls on, as a stable name.
    pub name: String,
    /// Address the master connects back to for catalog reads and writes.
    pub address: SocketAddr,
    /// Process start timestamp in unix milliseconds.
    pub start_code: u64,
}

impl ServerIdentity {
    pub fn key(&self) -> String {
        format!("{}/{}", self.name, self.start_code)
    }
}

impl std::fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.start_code)
    }
}

/// Load summary a server includes in each report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLoad {
    pub regions: u32,
    pub requests: u32,
}

/// Status messages a storage server reports to the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerStatusMessage {
    RegionOpened(RegionDescriptor),
    RegionClosed(RegionDescriptor),
    RegionSplit {
        parent: RegionDescriptor,
        daughter_a: RegionDescriptor,
        daughter_b: RegionDescriptor,
    },
    ProcessingError {
        region: RegionDescriptor,
        message: String,
    },
    Quiesced,
    Exiting,
}

/// Instructions the master hands back in a report response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerInstruction {
    OpenRegion(RegionDescriptor),
    CloseRegion {
        region: RegionDescriptor,
        delete: bool,
    },
    /// Close user regions but keep serving catalog regions; part of cluster
    /// shutdown.
    Quiesce,
    Stop,
}

/// Configuration subset a storage server needs before it can serve regions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSubset {
    pub catalog_root: String,
    pub filesystem_uri: String,
}

#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub identity: ServerIdentity,
    pub load: ServerLoad,
    pub quiesced: bool,
}

pub struct ServerManager {
    leases: LeaseTracker,
    servers: Mutex<HashMap<String, ServerRecord>>,
    /// Identities whose lease expired or that reported death; their records
    /// stay visible until recovery confirms every region moved.
    dead: Mutex<HashSet<String>>,
    ops: OpSender,
    startup_config: ConfigSubset,
    /// Grace before a recovery operation first runs; it also lands on the
    /// delayed queue, which is gated on a known root location.
    recovery_delay: Duration,
}

impl ServerManager {
    pub fn new(
        leases: LeaseTracker,
        ops: OpSender,
        startup_config: ConfigSubset,
        recovery_delay: Duration,
    ) -> Self {
        Self {
            leases,
            servers: Mutex::new(HashMap::new()),
            dead: Mutex::new(HashSet::new()),
            ops,
            startup_config,
            recovery_delay,
        }
    }

    /// Register a new storage server and grant its lease. Returns the
    /// configuration subset the server needs to initialize.
    pub fn startup(&self, identity: ServerIdentity, load: ServerLoad) -> Result<ConfigSubset> {
        let key = identity.key();
        let pending_recovery = self.dead.lock().unwrap().contains(&key);
        {
            let mut servers = self.servers.lock().unwrap();
            if servers.contains_key(&key) && !pending_recovery {
                return Err(MasterError::DuplicateServer(key));
            }
            servers.insert(
                key.clone(),
                ServerRecord {
                    identity: identity.clone(),
                    load,
                    quiesced: false,
                },
            );
        }
        self.leases.grant(&key);
        tracing::info!(server = %identity, "storage server registered");
        Ok(self.startup_config.clone())
    }

    /// Ingest one status report: renew the lease, update load, translate
    /// status messages, and build the outbound instruction list.
    pub fn report(
        &self,
        state: &MasterState,
        identity: &ServerIdentity,
        load: ServerLoad,
        messages: Vec<ServerStatusMessage>,
    ) -> Result<Vec<ServerInstruction>> {
        let key = identity.key();

        if state.closed() {
            // Drain phase: the only thing left to learn is that a server is
            // gone; everyone else is told to stop.
            if messages
                .iter()
                .any(|m| matches!(m, ServerStatusMessage::Exiting))
            {
                self.server_exited(state, identity);
            }
            return Ok(vec![ServerInstruction::Stop]);
        }

        if !self.is_live(&key) {
            return Err(MasterError::UnknownServer(key));
        }
        if self.leases.renew(&key) == Renewal::Expired {
            // The lease lapsed between heartbeats; recovery owns this
            // identity now and the server must re-register.
            return Err(MasterError::UnknownServer(key));
        }

        if let Some(record) = self.servers.lock().unwrap().get_mut(&key) {
            record.load = load;
        }

        let rm = &state.region_manager;
        let mut instructions = Vec::new();
        for message in messages {
            match message {
                ServerStatusMessage::Exiting => {
                    self.server_exited(state, identity);
                    return Ok(vec![ServerInstruction::Stop]);
                }
                ServerStatusMessage::Quiesced => {
                    if let Some(record) = self.servers.lock().unwrap().get_mut(&key) {
                        record.quiesced = true;
                    }
                }
                ServerStatusMessage::RegionOpened(desc) => {
                    let name = desc.region_name();
                    let already_here = rm
                        .assignment_of(&name)
                        .map(|a| a.server == key)
                        .unwrap_or(false);
                    if already_here {
                        continue;
                    }
                    match rm.pending_open_server(&name) {
                        Some(server) if server == key => {
                            self.enqueue(Operation::confirm_region_open(identity.clone(), desc));
                        }
                        _ => {
                            tracing::warn!(
                                server = %identity,
                                region = %String::from_utf8_lossy(&name),
                                "unexpected region open; instructing close"
                            );
                            instructions.push(ServerInstruction::CloseRegion {
                                region: desc,
                                delete: false,
                            });
                        }
                    }
                }
                ServerStatusMessage::RegionClosed(desc) => {
                    let kind = rm
                        .take_pending_close(&desc.region_name())
                        .unwrap_or(CloseKind::Reassign);
                    self.enqueue(Operation::confirm_region_close(
                        identity.clone(),
                        desc,
                        kind,
                    ));
                }
                ServerStatusMessage::RegionSplit {
                    parent,
                    daughter_a,
                    daughter_b,
                } => {
                    rm.process_split(&parent, daughter_a, daughter_b);
                }
                ServerStatusMessage::ProcessingError { region, message } => {
                    tracing::warn!(
                        server = %identity,
                        region = %String::from_utf8_lossy(&region.region_name()),
                        message,
                        "storage server reported a processing error"
                    );
                    rm.abort_pending_open(&region.region_name(), Some(region));
                }
            }
        }

        if state.shutdown_requested() {
            let quiesced = self
                .servers
                .lock()
                .unwrap()
                .get(&key)
                .map(|r| r.quiesced)
                .unwrap_or(true);
            if quiesced || load.regions == 0 {
                return Ok(vec![ServerInstruction::Stop]);
            }
            instructions.push(ServerInstruction::Quiesce);
            return Ok(instructions);
        }

        for close in rm.drain_closes(&key) {
            instructions.push(ServerInstruction::CloseRegion {
                region: close.desc,
                delete: close.kind == CloseKind::Delete,
            });
        }
        for desc in rm.regions_to_assign(&key, self.live_server_count()) {
            tracing::info!(
                server = %identity,
                region = %String::from_utf8_lossy(&desc.region_name()),
                "assigning region"
            );
            instructions.push(ServerInstruction::OpenRegion(desc));
        }
        Ok(instructions)
    }

    /// A server reported its own death. Outside cluster shutdown this is the
    /// explicit-death path into recovery; during shutdown it is the normal
    /// way servers leave.
    fn server_exited(&self, state: &MasterState, identity: &ServerIdentity) {
        let key = identity.key();
        self.leases.cancel(&key);
        if state.shutdown_requested() || state.closed() {
            self.servers.lock().unwrap().remove(&key);
            self.dead.lock().unwrap().remove(&key);
            tracing::info!(server = %identity, "storage server exited");
        } else {
            tracing::info!(server = %identity, "storage server reported shutdown; recovering its regions");
            self.schedule_recovery(identity.clone());
        }
    }

    /// Mark an identity dead and queue the recovery operation that reclaims
    /// every region it hosted.
    pub fn schedule_recovery(&self, identity: ServerIdentity) {
        let key = identity.key();
        if !self.servers.lock().unwrap().contains_key(&key) {
            return;
        }
        if !self.dead.lock().unwrap().insert(key.clone()) {
            return;
        }
        if let Err(err) = self
            .ops
            .enqueue_after(Operation::server_recovery(identity), self.recovery_delay)
        {
            tracing::error!(error = %err, "failed to enqueue server recovery");
        }
    }

    /// Called by the recovery operation once every region is confirmed
    /// re-opened elsewhere: drop the record from the live-server map.
    pub fn remove_recovered(&self, identity: &ServerIdentity) {
        let key = identity.key();
        self.dead.lock().unwrap().remove(&key);
        let mut servers = self.servers.lock().unwrap();
        if let Some(record) = servers.get(&key) {
            if record.identity.start_code == identity.start_code {
                servers.remove(&key);
            }
        }
        tracing::info!(server = %identity, "storage server record removed after recovery");
    }

    fn enqueue(&self, op: Operation) {
        if let Err(err) = self.ops.enqueue(op) {
            tracing::error!(error = %err, "failed to enqueue operation from server manager");
        }
    }

    pub fn is_live(&self, key: &str) -> bool {
        if self.dead.lock().unwrap().contains(key) {
            return false;
        }
        self.servers.lock().unwrap().contains_key(key)
    }

    pub fn is_live_addr(&self, addr: SocketAddr) -> bool {
        self.record_by_addr(addr).is_some()
    }

    /// The live record answering catalog calls on `addr`, if any.
    pub fn record_by_addr(&self, addr: SocketAddr) -> Option<ServerRecord> {
        let dead = self.dead.lock().unwrap();
        self.servers
            .lock()
            .unwrap()
            .values()
            .find(|r| r.identity.address == addr && !dead.contains(&r.identity.key()))
            .cloned()
    }

    pub fn live_server_count(&self) -> usize {
        let dead = self.dead.lock().unwrap();
        self.servers
            .lock()
            .unwrap()
            .keys()
            .filter(|key| !dead.contains(*key))
            .count()
    }

    pub fn server_count(&self) -> usize {
        self.servers.lock().unwrap().len()
    }

    /// Read-only snapshot of the live server → load map.
    pub fn load_snapshot(&self) -> Vec<(String, ServerLoad)> {
        let dead = self.dead.lock().unwrap();
        let mut out: Vec<(String, ServerLoad)> = self
            .servers
            .lock()
            .unwrap()
            .values()
            .filter(|r| !dead.contains(&r.identity.key()))
            .map(|r| (r.identity.key(), r.load))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Wait for every storage server to report its own shutdown, bounded by
    /// the overall quiesce period.
    pub async fn let_servers_shutdown(&self, state: &MasterState) {
        let deadline = Instant::now() + state.config.drain_deadline;
        while self.server_count() > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    remaining = self.server_count(),
                    "drain deadline reached with storage servers still registered"
                );
                return;
            }
            tokio::time::sleep(state.config.wake_interval).await;
        }
        tracing::info!("all storage servers reported shutdown");
    }
}

/// Spawn the lease-expiry checker: on the wake cadence, pop expired leases
/// and queue recovery for the servers behind them.
pub fn spawn_expiry_checker(state: std::sync::Arc<MasterState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.wake_interval);
        loop {
            ticker.tick().await;
            if state.closed() {
                break;
            }
            for key in state.server_manager.leases.pop_expired(Instant::now()) {
                let record = state.server_manager.servers.lock().unwrap().get(&key).cloned();
                let Some(record) = record else { continue };
                tracing::warn!(server = %record.identity, "storage server lease expired");
                state.server_manager.schedule_recovery(record.identity);
            }
        }
    });
}
