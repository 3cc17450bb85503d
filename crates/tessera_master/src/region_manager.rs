//! Region assignment state and the background catalog scanners.
//!
//! The region manager owns every location fact the master holds: where the
//! root region is, which meta regions are online, which regions are waiting
//! for a server, and which opens/closes are in flight. The scanners
//! periodically re-read the root and meta regions and reconcile what they
//! find into this state; everything else only reads snapshots of it.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::catalog::{
    covering_meta, first_meta_region_desc, root_region_desc, table_name_of, CatalogRow,
    MetaRegionLocation, RegionDescriptor, COL_REGIONINFO, META_TABLE,
};
use crate::dfs::{Dfs, FILE_SYSTEM_VERSION};
use crate::error::{MasterError, Result};
use crate::MasterState;

/// Why a region is being closed; decides what happens when the hosting
/// server confirms the close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Table deletion: drop the region's storage once closed.
    Delete,
    /// Table disable: the region stays offline until re-enabled.
    Offline,
    /// Unexpected close: put the region back up for assignment.
    Reassign,
}

/// A close instruction queued for one server.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub desc: RegionDescriptor,
    pub kind: CloseKind,
}

#[derive(Debug, Clone)]
struct PendingOpen {
    server: String,
    deadline: Instant,
}

/// An online data region and the server it was confirmed open on.
#[derive(Debug, Clone)]
pub struct RegionAssignment {
    pub desc: RegionDescriptor,
    pub server: String,
}

pub struct RegionManager {
    rescan_interval: Duration,
    wake_interval: Duration,
    max_region_open_time: Duration,
    root_location: Mutex<Option<SocketAddr>>,
    root_scanned: AtomicBool,
    meta_scanned: AtomicBool,
    /// Online meta regions keyed by the start key of the catalog keyspace
    /// slice they cover.
    online_metas: Mutex<BTreeMap<Vec<u8>, MetaRegionLocation>>,
    /// Regions waiting for a server, keyed by region name. Catalog regions
    /// sort first, so they are always handed out before user regions.
    unassigned: Mutex<BTreeMap<Vec<u8>, RegionDescriptor>>,
    pending_open: Mutex<HashMap<Vec<u8>, PendingOpen>>,
    pending_close: Mutex<HashMap<Vec<u8>, CloseKind>>,
    to_close: Mutex<HashMap<String, Vec<CloseRequest>>>,
    assignments: Mutex<BTreeMap<Vec<u8>, RegionAssignment>>,
    scan_trigger: Notify,
}

impl RegionManager {
    pub fn new(
        rescan_interval: Duration,
        wake_interval: Duration,
        max_region_open_time: Duration,
    ) -> Self {
        Self {
            rescan_interval,
            wake_interval,
            max_region_open_time,
            root_location: Mutex::new(None),
            root_scanned: AtomicBool::new(false),
            meta_scanned: AtomicBool::new(false),
            online_metas: Mutex::new(BTreeMap::new()),
            unassigned: Mutex::new(BTreeMap::new()),
            pending_open: Mutex::new(HashMap::new()),
            pending_close: Mutex::new(HashMap::new()),
            to_close: Mutex::new(HashMap::new()),
            assignments: Mutex::new(BTreeMap::new()),
            scan_trigger: Notify::new(),
        }
    }

    pub fn root_location(&self) -> Option<SocketAddr> {
        *self.root_location.lock().unwrap()
    }

    pub fn set_root_location(&self, location: Option<SocketAddr>) {
        *self.root_location.lock().unwrap() = location;
        if location.is_some() {
            self.trigger_scan();
        } else {
            self.root_scanned.store(false, Ordering::SeqCst);
        }
    }

    /// Ask the scanners to run as soon as they are parked.
    pub fn trigger_scan(&self) {
        self.scan_trigger.notify_waiters();
    }

    /// Block until the root location is published, bounded by the wake
    /// cadence so shutdown is always observed.
    pub async fn wait_for_root_location(&self, state: &MasterState) -> Option<SocketAddr> {
        loop {
            if let Some(addr) = self.root_location() {
                return Some(addr);
            }
            if state.closed() {
                return None;
            }
            tokio::time::sleep(self.wake_interval).await;
        }
    }

    /// The gate deferring catalog-dependent operations: true once the root
    /// has been scanned and at least one meta region has been scanned
    /// online.
    pub fn catalog_ready(&self) -> bool {
        self.root_scanned.load(Ordering::SeqCst)
            && self.meta_scanned.load(Ordering::SeqCst)
            && !self.online_metas.lock().unwrap().is_empty()
    }

    /// Block the caller until the catalog is ready, or report failure if the
    /// master shuts down in the meantime.
    pub async fn wait_for_meta_online_or_close(&self, state: &MasterState) -> bool {
        loop {
            if self.catalog_ready() {
                return true;
            }
            if state.closed() {
                return false;
            }
            tokio::time::sleep(self.wake_interval).await;
        }
    }

    pub fn online_meta_snapshot(&self) -> Vec<MetaRegionLocation> {
        self.online_metas.lock().unwrap().values().cloned().collect()
    }

    pub fn online_meta_count(&self) -> usize {
        self.online_metas.lock().unwrap().len()
    }

    /// Which meta region covers the given catalog row key.
    pub fn meta_region_for(&self, row: &[u8]) -> Result<MetaRegionLocation> {
        let metas = self.online_metas.lock().unwrap();
        covering_meta(&metas, row)
            .cloned()
            .ok_or(MasterError::CatalogUnavailable)
    }

    /// The catalog region holding the descriptor row of `desc`: the root
    /// region for meta regions, the covering meta region for user regions.
    pub fn owning_catalog_region(&self, desc: &RegionDescriptor) -> Result<MetaRegionLocation> {
        if desc.is_meta() {
            let server = self.root_location().ok_or(MasterError::CatalogUnavailable)?;
            let root = root_region_desc();
            return Ok(MetaRegionLocation {
                region_name: root.region_name(),
                start_key: Vec::new(),
                server,
            });
        }
        self.meta_region_for(&desc.region_name())
    }

    pub fn record_meta_online(&self, location: MetaRegionLocation) {
        self.online_metas
            .lock()
            .unwrap()
            .insert(location.start_key.clone(), location);
        self.trigger_scan();
    }

    /// Drop online meta regions served by `addr`; returns what was dropped.
    pub fn remove_metas_of(&self, addr: SocketAddr) -> Vec<MetaRegionLocation> {
        let mut metas = self.online_metas.lock().unwrap();
        let gone: Vec<MetaRegionLocation> = metas
            .values()
            .filter(|loc| loc.server == addr)
            .cloned()
            .collect();
        for loc in &gone {
            metas.remove(&loc.start_key);
        }
        gone
    }

    pub fn meta_online_by_name(&self, region_name: &[u8]) -> bool {
        self.online_metas
            .lock()
            .unwrap()
            .values()
            .any(|loc| loc.region_name == region_name)
    }

    pub fn mark_unassigned(&self, desc: RegionDescriptor) {
        let name = desc.region_name();
        if self.pending_open.lock().unwrap().contains_key(&name) {
            return;
        }
        self.unassigned.lock().unwrap().insert(name, desc);
    }

    pub fn is_unassigned(&self, region_name: &[u8]) -> bool {
        self.unassigned.lock().unwrap().contains_key(region_name)
    }

    pub fn forget_unassigned(&self, region_name: &[u8]) {
        self.unassigned.lock().unwrap().remove(region_name);
    }

    pub fn unassigned_count(&self) -> usize {
        self.unassigned.lock().unwrap().len()
    }

    /// Pick regions for a reporting server to open. Opens that blew their
    /// deadline are reclaimed first; the root region is always assigned
    /// alone so nothing else depends on an unknown root.
    pub fn regions_to_assign(&self, server: &str, live_servers: usize) -> Vec<RegionDescriptor> {
        self.reclaim_expired_opens();

        let mut unassigned = self.unassigned.lock().unwrap();
        if unassigned.is_empty() {
            return Vec::new();
        }

        let root_name = root_region_desc().region_name();
        let picked: Vec<RegionDescriptor> = if let Some(root) = unassigned.remove(&root_name) {
            vec![root]
        } else {
            // Even spread: hand each reporting server its share of the
            // backlog, catalog regions first by name order.
            let share = unassigned.len().div_ceil(live_servers.max(1));
            let names: Vec<Vec<u8>> = unassigned.keys().take(share).cloned().collect();
            names
                .into_iter()
                .filter_map(|name| unassigned.remove(&name))
                .collect()
        };
        drop(unassigned);

        let mut pending = self.pending_open.lock().unwrap();
        let deadline = Instant::now() + self.max_region_open_time;
        for desc in &picked {
            pending.insert(
                desc.region_name(),
                PendingOpen {
                    server: server.to_string(),
                    deadline,
                },
            );
        }
        picked
    }

    fn reclaim_expired_opens(&self) {
        let now = Instant::now();
        let pending = self.pending_open.lock().unwrap();
        let expired: Vec<Vec<u8>> = pending
            .iter()
            .filter(|(_, open)| open.deadline <= now)
            .map(|(name, _)| name.clone())
            .collect();
        drop(pending);
        for name in expired {
            if let Some(open) = self.pending_open.lock().unwrap().remove(&name) {
                tracing::info!(
                    region = %String::from_utf8_lossy(&name),
                    server = %open.server,
                    "region open timed out; reassigning"
                );
            }
            // The descriptor is recovered from the catalog by the next scan;
            // data regions we still know about go straight back.
            if name == root_region_desc().region_name() {
                self.unassigned
                    .lock()
                    .unwrap()
                    .insert(name, root_region_desc());
            } else if table_name_of(&name) == META_TABLE.as_bytes() {
                self.unassigned
                    .lock()
                    .unwrap()
                    .insert(name, first_meta_region_desc());
            } else {
                self.trigger_scan();
            }
        }
    }

    pub fn confirm_open(&self, region_name: &[u8]) {
        self.pending_open.lock().unwrap().remove(region_name);
    }

    pub fn pending_open_server(&self, region_name: &[u8]) -> Option<String> {
        self.pending_open
            .lock()
            .unwrap()
            .get(region_name)
            .map(|open| open.server.clone())
    }

    pub fn abort_pending_open(&self, region_name: &[u8], desc: Option<RegionDescriptor>) {
        self.pending_open.lock().unwrap().remove(region_name);
        if let Some(desc) = desc {
            self.mark_unassigned(desc);
        }
    }

    pub fn queue_close(&self, server: &str, desc: RegionDescriptor, kind: CloseKind) {
        let name = desc.region_name();
        self.pending_close.lock().unwrap().insert(name, kind);
        self.to_close
            .lock()
            .unwrap()
            .entry(server.to_string())
            .or_default()
            .push(CloseRequest { desc, kind });
    }

    pub fn drain_closes(&self, server: &str) -> Vec<CloseRequest> {
        self.to_close
            .lock()
            .unwrap()
            .remove(server)
            .unwrap_or_default()
    }

    pub fn take_pending_close(&self, region_name: &[u8]) -> Option<CloseKind> {
        self.pending_close.lock().unwrap().remove(region_name)
    }

    pub fn pending_close_kind(&self, region_name: &[u8]) -> Option<CloseKind> {
        self.pending_close.lock().unwrap().get(region_name).copied()
    }

    pub fn record_assignment(&self, desc: RegionDescriptor, server: &str) {
        self.assignments.lock().unwrap().insert(
            desc.region_name(),
            RegionAssignment {
                desc,
                server: server.to_string(),
            },
        );
    }

    pub fn remove_assignment(&self, region_name: &[u8]) -> Option<RegionAssignment> {
        self.assignments.lock().unwrap().remove(region_name)
    }

    pub fn assignment_of(&self, region_name: &[u8]) -> Option<RegionAssignment> {
        self.assignments.lock().unwrap().get(region_name).cloned()
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.lock().unwrap().len()
    }

    /// Remove and return every data-region assignment held by `server`.
    pub fn take_assignments_of(&self, server: &str) -> Vec<RegionDescriptor> {
        let mut assignments = self.assignments.lock().unwrap();
        let names: Vec<Vec<u8>> = assignments
            .iter()
            .filter(|(_, a)| a.server == server)
            .map(|(name, _)| name.clone())
            .collect();
        names
            .into_iter()
            .filter_map(|name| assignments.remove(&name))
            .map(|a| a.desc)
            .collect()
    }

    /// A split retires the parent; both daughters wait for assignment. The
    /// daughters' catalog rows were written by the storage server that
    /// performed the split; the next meta scan reconciles them.
    pub fn process_split(
        &self,
        parent: &RegionDescriptor,
        daughter_a: RegionDescriptor,
        daughter_b: RegionDescriptor,
    ) {
        tracing::info!(
            parent = %String::from_utf8_lossy(&parent.region_name()),
            "region split reported"
        );
        self.remove_assignment(&parent.region_name());
        self.mark_unassigned(daughter_a);
        self.mark_unassigned(daughter_b);
        self.trigger_scan();
    }

    fn mark_root_scanned(&self) {
        self.root_scanned.store(true, Ordering::SeqCst);
    }

    fn mark_meta_scanned(&self) {
        self.meta_scanned.store(true, Ordering::SeqCst);
    }
}

/// Create the root and first meta catalog regions if this filesystem has
/// never hosted a cluster, seeding the meta descriptor as the sole row of
/// the root region. Idempotent: decided by existence checks alone. Returns
/// whether genesis ran.
pub fn bootstrap_catalog(dfs: &dyn Dfs) -> Result<bool> {
    let fatal = |err: anyhow::Error| MasterError::Fatal(format!("{err:#}"));

    if !dfs.root_exists().map_err(fatal)? {
        dfs.create_root().map_err(fatal)?;
        dfs.write_version().map_err(fatal)?;
    } else {
        match dfs.read_version().map_err(fatal)? {
            Some(version) if version == FILE_SYSTEM_VERSION => {}
            other => {
                return Err(MasterError::Fatal(format!(
                    "filesystem holds data with version {:?} but this master requires {}; \
                     run a migration before starting",
                    other, FILE_SYSTEM_VERSION
                )));
            }
        }
    }

    let root = root_region_desc();
    let root_name = root.region_name();
    if dfs.region_exists(&root_name).map_err(fatal)? {
        return Ok(false);
    }

    tracing::info!("bootstrap: creating root and first meta catalog regions");
    let meta = first_meta_region_desc();
    dfs.create_region(&root).map_err(fatal)?;
    dfs.create_region(&meta).map_err(fatal)?;
    let mut row = CatalogRow::new(meta.region_name());
    row.cells.insert(COL_REGIONINFO.to_string(), meta.encode());
    dfs.seed_catalog_row(&root_name, &row).map_err(fatal)?;
    Ok(true)
}

/// Spawn the root and meta catalog scanners. They publish location facts
/// into the region manager until the master closes.
pub fn spawn_scanners(state: std::sync::Arc<MasterState>) {
    tokio::spawn({
        let state = state.clone();
        async move {
            scan_loop(state, ScanKind::Root).await;
        }
    });
    tokio::spawn(async move {
        scan_loop(state, ScanKind::Meta).await;
    });
}

#[derive(Clone, Copy, Debug)]
enum ScanKind {
    Root,
    Meta,
}

async fn scan_loop(state: std::sync::Arc<MasterState>, kind: ScanKind) {
    let rm = &state.region_manager;
    let mut next_scan = Instant::now();
    while !state.closed() {
        if Instant::now() >= next_scan {
            let result = match kind {
                ScanKind::Root => scan_root(&state).await,
                ScanKind::Meta => scan_metas(&state).await,
            };
            match result {
                Ok(rows) => tracing::debug!(?kind, rows, "catalog scan complete"),
                Err(err) => {
                    tracing::warn!(?kind, error = %err, "catalog scan failed");
                    state.check_filesystem();
                }
            }
            next_scan = Instant::now() + rm.rescan_interval;
        }
        let wait = rm
            .wake_interval
            .min(next_scan.saturating_duration_since(Instant::now()));
        if tokio::time::timeout(wait, rm.scan_trigger.notified())
            .await
            .is_ok()
        {
            next_scan = Instant::now();
        }
    }
    tracing::debug!(?kind, "catalog scanner stopped");
}

/// Re-read the root region: refresh the meta-region location list and queue
/// unserved meta regions for assignment.
pub(crate) async fn scan_root(state: &MasterState) -> Result<usize> {
    let rm = &state.region_manager;
    let Some(addr) = rm.root_location() else {
        return Ok(0);
    };
    let root_name = root_region_desc().region_name();
    let rows = scan_catalog_region(state, addr, &root_name, &[]).await?;
    let count = rows.len();
    for row in rows {
        let Some(desc) = row.descriptor() else {
            tracing::warn!(
                row = %String::from_utf8_lossy(&row.row_key),
                "root region row has no descriptor; skipping"
            );
            continue;
        };
        match row.server() {
            Some(server) if state.server_manager.is_live_addr(server) => {
                rm.online_metas.lock().unwrap().insert(
                    desc.start_key.clone(),
                    MetaRegionLocation {
                        region_name: desc.region_name(),
                        start_key: desc.start_key.clone(),
                        server,
                    },
                );
            }
            _ => {
                let name = desc.region_name();
                rm.online_metas.lock().unwrap().remove(&desc.start_key);
                if rm.pending_open_server(&name).is_none() {
                    rm.mark_unassigned(desc);
                }
            }
        }
    }
    rm.mark_root_scanned();
    Ok(count)
}

/// Re-read each online meta region: refresh data-region assignment facts and
/// queue unserved regions for assignment.
pub(crate) async fn scan_metas(state: &MasterState) -> Result<usize> {
    let rm = &state.region_manager;
    if !rm.root_scanned.load(Ordering::SeqCst) {
        return Ok(0);
    }
    let metas = rm.online_meta_snapshot();
    if metas.is_empty() {
        return Ok(0);
    }
    let mut count = 0;
    for meta in metas {
        let rows = scan_catalog_region(state, meta.server, &meta.region_name, &[]).await?;
        count += rows.len();
        for row in rows {
            let Some(desc) = row.descriptor() else {
                tracing::warn!(
                    row = %String::from_utf8_lossy(&row.row_key),
                    "meta region row has no descriptor; skipping"
                );
                continue;
            };
            if desc.offline || desc.split {
                continue;
            }
            let name = desc.region_name();
            match row.server() {
                Some(server) => {
                    if let Some(record) = state.server_manager.record_by_addr(server) {
                        rm.record_assignment(desc, &record.identity.key());
                        continue;
                    }
                    // Stale assignment to a dead server.
                    rm.remove_assignment(&name);
                    if rm.pending_open_server(&name).is_none()
                        && rm.pending_close_kind(&name).is_none()
                    {
                        rm.mark_unassigned(desc);
                    }
                }
                None => {
                    if rm.pending_open_server(&name).is_none()
                        && rm.assignment_of(&name).is_none()
                    {
                        rm.mark_unassigned(desc);
                    }
                }
            }
        }
    }
    rm.mark_meta_scanned();
    Ok(count)
}

/// Open a scanner on a catalog region, drain it, and close it.
pub async fn scan_catalog_region(
    state: &MasterState,
    server: SocketAddr,
    region_name: &[u8],
    start_row: &[u8],
) -> Result<Vec<CatalogRow>> {
    let conn = state.connection(server);
    let scanner = conn.open_scanner(region_name, start_row).await?;
    let mut rows = Vec::new();
    let result = loop {
        match conn.next_row(scanner).await {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    if let Err(err) = conn.close_scanner(scanner).await {
        tracing::debug!(error = %err, "closing catalog scanner failed");
    }
    result?;
    Ok(rows)
}
