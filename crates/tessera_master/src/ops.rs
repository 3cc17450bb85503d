//! Retryable units of work executed by the control loop.
//!
//! One variant per operation kind, one dispatch function. Every operation
//! either completes, reports `Blocked` because its catalog precondition is
//! not yet satisfied, or raises an error the control loop classifies. All
//! schema mutations are idempotent with respect to re-execution: re-scanning
//! and re-applying to an already-mutated row changes nothing.

use std::collections::BTreeSet;

use tokio::sync::oneshot;

use crate::catalog::{
    root_region_desc, table_name_of, CatalogMutation, CatalogRow, ColumnSpec,
    MetaRegionLocation, RegionDescriptor, META_TABLE,
};
use crate::error::{MasterError, Result};
use crate::queue::OpStatus;
use crate::region_manager::{scan_catalog_region, CloseKind};
use crate::server_manager::ServerIdentity;
use crate::MasterState;

/// Completion plumbing shared by the queued schema mutations: the waiting
/// request handler and the remaining retry budget for recoverable failures.
pub struct MutationCtx {
    completion: Option<oneshot::Sender<Result<()>>>,
    retries: u32,
}

impl MutationCtx {
    pub fn new(completion: oneshot::Sender<Result<()>>, retries: u32) -> Self {
        Self {
            completion: Some(completion),
            retries,
        }
    }

    /// No waiter; used by internal re-submissions and tests.
    pub fn detached() -> Self {
        Self {
            completion: None,
            retries: 0,
        }
    }
}

pub struct CreateTable {
    pub desc: RegionDescriptor,
}

pub struct DeleteTable {
    pub table: String,
    pub ctx: MutationCtx,
}

pub struct AddColumn {
    pub table: String,
    pub spec: ColumnSpec,
    pub ctx: MutationCtx,
}

pub struct ModifyColumn {
    pub table: String,
    pub family: String,
    pub spec: ColumnSpec,
    pub ctx: MutationCtx,
}

pub struct DeleteColumn {
    pub table: String,
    pub family: String,
    pub ctx: MutationCtx,
}

pub struct ChangeTableState {
    pub table: String,
    pub enable: bool,
    pub ctx: MutationCtx,
}

pub struct ConfirmRegionOpen {
    pub server: ServerIdentity,
    pub region: RegionDescriptor,
}

pub struct ConfirmRegionClose {
    pub server: ServerIdentity,
    pub region: RegionDescriptor,
    pub kind: CloseKind,
}

pub struct ServerRecovery {
    pub server: ServerIdentity,
    scanned: bool,
    remaining: BTreeSet<Vec<u8>>,
}

pub enum Operation {
    CreateTable(CreateTable),
    DeleteTable(DeleteTable),
    AddColumn(AddColumn),
    ModifyColumn(ModifyColumn),
    DeleteColumn(DeleteColumn),
    ChangeTableState(ChangeTableState),
    ConfirmRegionOpen(ConfirmRegionOpen),
    ConfirmRegionClose(ConfirmRegionClose),
    ServerRecovery(ServerRecovery),
}

impl Operation {
    pub fn create_table(desc: RegionDescriptor) -> Self {
        Operation::CreateTable(CreateTable { desc })
    }

    pub fn delete_table(table: String, ctx: MutationCtx) -> Self {
        Operation::DeleteTable(DeleteTable { table, ctx })
    }

    pub fn add_column(table: String, spec: ColumnSpec, ctx: MutationCtx) -> Self {
        Operation::AddColumn(AddColumn { table, spec, ctx })
    }

    pub fn modify_column(table: String, family: String, spec: ColumnSpec, ctx: MutationCtx) -> Self {
        Operation::ModifyColumn(ModifyColumn {
            table,
            family,
            spec,
            ctx,
        })
    }

    pub fn delete_column(table: String, family: String, ctx: MutationCtx) -> Self {
        Operation::DeleteColumn(DeleteColumn { table, family, ctx })
    }

    pub fn change_table_state(table: String, enable: bool, ctx: MutationCtx) -> Self {
        Operation::ChangeTableState(ChangeTableState { table, enable, ctx })
    }

    pub fn confirm_region_open(server: ServerIdentity, region: RegionDescriptor) -> Self {
        Operation::ConfirmRegionOpen(ConfirmRegionOpen { server, region })
    }

    pub fn confirm_region_close(
        server: ServerIdentity,
        region: RegionDescriptor,
        kind: CloseKind,
    ) -> Self {
        Operation::ConfirmRegionClose(ConfirmRegionClose {
            server,
            region,
            kind,
        })
    }

    pub fn server_recovery(server: ServerIdentity) -> Self {
        Operation::ServerRecovery(ServerRecovery {
            server,
            scanned: false,
            remaining: BTreeSet::new(),
        })
    }

    /// Execute one attempt of this operation.
    pub async fn process(&mut self, state: &MasterState) -> Result<OpStatus> {
        match self {
            Operation::CreateTable(op) => op.process(state).await,
            Operation::DeleteTable(op) => op.process(state).await,
            Operation::AddColumn(op) => op.process(state).await,
            Operation::ModifyColumn(op) => op.process(state).await,
            Operation::DeleteColumn(op) => op.process(state).await,
            Operation::ChangeTableState(op) => op.process(state).await,
            Operation::ConfirmRegionOpen(op) => op.process(state).await,
            Operation::ConfirmRegionClose(op) => op.process(state).await,
            Operation::ServerRecovery(op) => op.process(state).await,
        }
    }

    /// Deliver the final outcome to a waiting request handler, if any.
    pub fn finish(self, result: Result<()>) {
        if let Some(tx) = self.take_completion() {
            let _ = tx.send(result);
        }
    }

    /// Decide whether a failed operation goes back on the queue. Operations
    /// with a waiting handler burn their retry budget; confirmation and
    /// recovery operations retry until the master closes.
    pub fn note_failure(mut self, err: MasterError) -> Option<Operation> {
        if !err.is_recoverable() {
            self.finish(Err(err));
            return None;
        }
        let exhausted = match self.ctx_mut() {
            None => return Some(self),
            Some(ctx) => {
                if ctx.retries == 0 {
                    true
                } else {
                    ctx.retries -= 1;
                    false
                }
            }
        };
        if exhausted {
            self.finish(Err(err));
            None
        } else {
            Some(self)
        }
    }

    fn ctx_mut(&mut self) -> Option<&mut MutationCtx> {
        match self {
            Operation::DeleteTable(op) => Some(&mut op.ctx),
            Operation::AddColumn(op) => Some(&mut op.ctx),
            Operation::ModifyColumn(op) => Some(&mut op.ctx),
            Operation::DeleteColumn(op) => Some(&mut op.ctx),
            Operation::ChangeTableState(op) => Some(&mut op.ctx),
            _ => None,
        }
    }

    fn take_completion(self) -> Option<oneshot::Sender<Result<()>>> {
        match self {
            Operation::DeleteTable(op) => op.ctx.completion,
            Operation::AddColumn(op) => op.ctx.completion,
            Operation::ModifyColumn(op) => op.ctx.completion,
            Operation::DeleteColumn(op) => op.ctx.completion,
            Operation::ChangeTableState(op) => op.ctx.completion,
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::CreateTable(op) => write!(f, "create table {}", op.desc.table.name),
            Operation::DeleteTable(op) => write!(f, "delete table {}", op.table),
            Operation::AddColumn(op) => {
                write!(f, "add column {}:{}", op.table, op.spec.family)
            }
            Operation::ModifyColumn(op) => write!(f, "modify column {}:{}", op.table, op.family),
            Operation::DeleteColumn(op) => write!(f, "delete column {}:{}", op.table, op.family),
            Operation::ChangeTableState(op) => write!(
                f,
                "{} table {}",
                if op.enable { "enable" } else { "disable" },
                op.table
            ),
            Operation::ConfirmRegionOpen(op) => write!(
                f,
                "confirm open of {} on {}",
                String::from_utf8_lossy(&op.region.region_name()),
                op.server
            ),
            Operation::ConfirmRegionClose(op) => write!(
                f,
                "confirm close of {} on {}",
                String::from_utf8_lossy(&op.region.region_name()),
                op.server
            ),
            Operation::ServerRecovery(op) => write!(f, "recover server {}", op.server),
        }
    }
}

/// Scan every online meta region for the descriptor rows of `table`. Rows
/// come back sorted by region name within each meta region.
async fn table_rows(
    state: &MasterState,
    table: &str,
) -> Result<Vec<(MetaRegionLocation, CatalogRow)>> {
    let mut out = Vec::new();
    for meta in state.region_manager.online_meta_snapshot() {
        let rows =
            scan_catalog_region(state, meta.server, &meta.region_name, table.as_bytes()).await?;
        for row in rows {
            let name = table_name_of(&row.row_key);
            if name == table.as_bytes() {
                out.push((meta.clone(), row));
            } else if name > table.as_bytes() {
                break;
            }
        }
    }
    Ok(out)
}

fn dfs_err(err: anyhow::Error) -> MasterError {
    MasterError::RemoteCall(format!("{err:#}"))
}

impl CreateTable {
    /// One creation attempt. Driven directly by the request handler under
    /// the in-creation guard, with the handler owning the retry budget.
    async fn process(&mut self, state: &MasterState) -> Result<OpStatus> {
        if !state.region_manager.catalog_ready() {
            return Err(MasterError::CatalogUnavailable);
        }
        let table = self.desc.table.name.clone();
        let region_name = self.desc.region_name();
        let meta = state.region_manager.meta_region_for(&region_name)?;

        // A scan positioned at the table name lands on the first region of
        // the table if it exists at all.
        let rows =
            scan_catalog_region(state, meta.server, &meta.region_name, table.as_bytes()).await?;
        if rows
            .iter()
            .any(|row| table_name_of(&row.row_key) == table.as_bytes())
        {
            return Err(MasterError::TableExists(table));
        }

        state.dfs.create_region(&self.desc).map_err(dfs_err)?;
        let mutation = CatalogMutation::put(region_name).set_descriptor(&self.desc);
        state
            .connection(meta.server)
            .mutate(&meta.region_name, mutation)
            .await?;
        state.region_manager.mark_unassigned(self.desc.clone());
        tracing::info!(table = %table, "created table");
        Ok(OpStatus::Done)
    }
}

impl DeleteTable {
    async fn process(&mut self, state: &MasterState) -> Result<OpStatus> {
        if !state.region_manager.catalog_ready() {
            return Ok(OpStatus::Blocked);
        }
        let rows = table_rows(state, &self.table).await?;
        if rows.is_empty() {
            return Err(MasterError::TableNotFound(self.table.clone()));
        }
        let rm = &state.region_manager;
        for (meta, row) in rows {
            let name = row.row_key.clone();
            rm.forget_unassigned(&name);
            match row.descriptor() {
                Some(desc) => {
                    if let Some(assignment) = rm.remove_assignment(&name) {
                        // Served regions are closed and dropped by their
                        // hosting server; unserved storage goes now.
                        rm.queue_close(&assignment.server, desc, CloseKind::Delete);
                    } else {
                        state.dfs.delete_region(&name).map_err(dfs_err)?;
                    }
                }
                None => {
                    tracing::warn!(
                        row = %String::from_utf8_lossy(&name),
                        "deleting catalog row without a descriptor"
                    );
                }
            }
            state
                .connection(meta.server)
                .mutate(&meta.region_name, CatalogMutation::delete_row(name))
                .await?;
        }
        tracing::info!(table = %self.table, "deleted table");
        Ok(OpStatus::Done)
    }
}

impl AddColumn {
    async fn process(&mut self, state: &MasterState) -> Result<OpStatus> {
        if !state.region_manager.catalog_ready() {
            return Ok(OpStatus::Blocked);
        }
        let rows = table_rows(state, &self.table).await?;
        if rows.is_empty() {
            return Err(MasterError::TableNotFound(self.table.clone()));
        }
        for (meta, row) in rows {
            let Some(mut desc) = row.descriptor() else {
                continue;
            };
            desc.table
                .families
                .insert(self.spec.family.clone(), self.spec.clone());
            let mutation = CatalogMutation::put(row.row_key).set_descriptor(&desc);
            state
                .connection(meta.server)
                .mutate(&meta.region_name, mutation)
                .await?;
        }
        tracing::info!(table = %self.table, family = %self.spec.family, "added column family");
        Ok(OpStatus::Done)
    }
}

impl ModifyColumn {
    async fn process(&mut self, state: &MasterState) -> Result<OpStatus> {
        if !state.region_manager.catalog_ready() {
            return Ok(OpStatus::Blocked);
        }
        let rows = table_rows(state, &self.table).await?;
        if rows.is_empty() {
            return Err(MasterError::TableNotFound(self.table.clone()));
        }
        for (meta, row) in rows {
            let Some(mut desc) = row.descriptor() else {
                continue;
            };
            if !desc.table.families.contains_key(&self.family) {
                return Err(MasterError::ColumnNotFound {
                    table: self.table.clone(),
                    family: self.family.clone(),
                });
            }
            desc.table
                .families
                .insert(self.family.clone(), self.spec.clone());
            let mutation = CatalogMutation::put(row.row_key).set_descriptor(&desc);
            state
                .connection(meta.server)
                .mutate(&meta.region_name, mutation)
                .await?;
        }
        tracing::info!(table = %self.table, family = %self.family, "modified column family");
        Ok(OpStatus::Done)
    }
}

impl DeleteColumn {
    async fn process(&mut self, state: &MasterState) -> Result<OpStatus> {
        if !state.region_manager.catalog_ready() {
            return Ok(OpStatus::Blocked);
        }
        let rows = table_rows(state, &self.table).await?;
        if rows.is_empty() {
            return Err(MasterError::TableNotFound(self.table.clone()));
        }
        for (meta, row) in rows {
            let Some(mut desc) = row.descriptor() else {
                continue;
            };
            desc.table.families.remove(&self.family);
            let mutation = CatalogMutation::put(row.row_key.clone()).set_descriptor(&desc);
            state
                .connection(meta.server)
                .mutate(&meta.region_name, mutation)
                .await?;
            if let Err(err) = state.dfs.delete_family(&row.row_key, &self.family) {
                tracing::warn!(error = %format!("{err:#}"), "failed to delete column family storage");
            }
        }
        tracing::info!(table = %self.table, family = %self.family, "deleted column family");
        Ok(OpStatus::Done)
    }
}

impl ChangeTableState {
    async fn process(&mut self, state: &MasterState) -> Result<OpStatus> {
        if !state.region_manager.catalog_ready() {
            return Ok(OpStatus::Blocked);
        }
        let rows = table_rows(state, &self.table).await?;
        if rows.is_empty() {
            return Err(MasterError::TableNotFound(self.table.clone()));
        }
        let rm = &state.region_manager;
        for (meta, row) in rows {
            let Some(mut desc) = row.descriptor() else {
                continue;
            };
            desc.offline = !self.enable;
            let name = desc.region_name();
            if self.enable {
                let mutation = CatalogMutation::put(row.row_key).set_descriptor(&desc);
                state
                    .connection(meta.server)
                    .mutate(&meta.region_name, mutation)
                    .await?;
                if rm.assignment_of(&name).is_none() && rm.pending_open_server(&name).is_none() {
                    rm.mark_unassigned(desc);
                }
            } else {
                // The catalog row goes offline first; the close instruction
                // follows through the per-server close queue.
                let mutation = CatalogMutation::put(row.row_key)
                    .set_descriptor(&desc)
                    .clear_assignment();
                state
                    .connection(meta.server)
                    .mutate(&meta.region_name, mutation)
                    .await?;
                rm.forget_unassigned(&name);
                if let Some(assignment) = rm.assignment_of(&name) {
                    rm.queue_close(&assignment.server, desc, CloseKind::Offline);
                }
            }
        }
        tracing::info!(
            table = %self.table,
            enable = self.enable,
            "changed table state"
        );
        Ok(OpStatus::Done)
    }
}

impl ConfirmRegionOpen {
    async fn process(&mut self, state: &MasterState) -> Result<OpStatus> {
        let rm = &state.region_manager;
        let name = self.region.region_name();

        if self.region.is_root() {
            rm.set_root_location(Some(self.server.address));
            rm.confirm_open(&name);
            tracing::info!(server = %self.server, "root region is online");
            return Ok(OpStatus::Done);
        }

        // The hosting fact becomes durable in the owning catalog region
        // before it is published in memory.
        let owning = match rm.owning_catalog_region(&self.region) {
            Ok(owning) => owning,
            Err(MasterError::CatalogUnavailable) => return Ok(OpStatus::Blocked),
            Err(err) => return Err(err),
        };
        let mutation = CatalogMutation::put(name.clone())
            .set_assignment(self.server.address, self.server.start_code);
        state
            .connection(owning.server)
            .mutate(&owning.region_name, mutation)
            .await?;

        if self.region.is_meta() {
            rm.record_meta_online(MetaRegionLocation {
                region_name: name.clone(),
                start_key: self.region.start_key.clone(),
                server: self.server.address,
            });
        } else {
            rm.record_assignment(self.region.clone(), &self.server.key());
        }
        rm.confirm_open(&name);
        tracing::info!(
            region = %String::from_utf8_lossy(&name),
            server = %self.server,
            "region open confirmed"
        );
        Ok(OpStatus::Done)
    }
}

impl ConfirmRegionClose {
    async fn process(&mut self, state: &MasterState) -> Result<OpStatus> {
        let rm = &state.region_manager;
        let name = self.region.region_name();
        rm.remove_assignment(&name);
        match self.kind {
            CloseKind::Delete => {
                state.dfs.delete_region(&name).map_err(dfs_err)?;
            }
            CloseKind::Offline => {}
            CloseKind::Reassign => {
                rm.mark_unassigned(self.region.clone());
            }
        }
        tracing::info!(
            region = %String::from_utf8_lossy(&name),
            server = %self.server,
            kind = ?self.kind,
            "region close confirmed"
        );
        Ok(OpStatus::Done)
    }
}

impl ServerRecovery {
    /// First pass reclaims everything the dead server hosted; subsequent
    /// passes block until each region is confirmed open elsewhere or its
    /// storage is gone for good.
    async fn process(&mut self, state: &MasterState) -> Result<OpStatus> {
        let rm = &state.region_manager;
        let key = self.server.key();

        if !self.scanned {
            if rm.root_location() == Some(self.server.address) {
                rm.set_root_location(None);
                let root = root_region_desc();
                self.remaining.insert(root.region_name());
                rm.mark_unassigned(root);
            }
            for meta in rm.remove_metas_of(self.server.address) {
                self.remaining.insert(meta.region_name);
            }
            for desc in rm.take_assignments_of(&key) {
                self.remaining.insert(desc.region_name());
                rm.mark_unassigned(desc);
            }
            rm.trigger_scan();
            tracing::info!(
                server = %self.server,
                regions = self.remaining.len(),
                "recovering regions from dead server"
            );
            self.scanned = true;
        }

        let mut still_waiting = BTreeSet::new();
        for name in std::mem::take(&mut self.remaining) {
            if region_reopened(state, &name, &self.server) {
                continue;
            }
            match state.dfs.region_exists(&name) {
                Ok(false) => {
                    tracing::warn!(
                        region = %String::from_utf8_lossy(&name),
                        "region storage is gone; marking permanently unavailable"
                    );
                }
                _ => {
                    still_waiting.insert(name);
                }
            }
        }
        self.remaining = still_waiting;

        if !self.remaining.is_empty() {
            return Ok(OpStatus::Blocked);
        }
        state.server_manager.remove_recovered(&self.server);
        tracing::info!(server = %self.server, "server recovery complete");
        Ok(OpStatus::Done)
    }
}

fn region_reopened(state: &MasterState, name: &[u8], dead: &ServerIdentity) -> bool {
    let rm = &state.region_manager;
    if name == root_region_desc().region_name().as_slice() {
        return rm
            .root_location()
            .map(|addr| addr != dead.address)
            .unwrap_or(false);
    }
    if table_name_of(name) == META_TABLE.as_bytes() {
        return rm.meta_online_by_name(name);
    }
    rm.assignment_of(name)
        .map(|a| a.server != dead.key())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{first_meta_region_desc, TableSchema};
    use crate::dfs::LocalDfs;
    use crate::queue::QueuedOperation;
    use crate::region_manager;
    use crate::server_manager::{ServerInstruction, ServerLoad, ServerStatusMessage};
    use crate::transport::{ConnectionFactory, RegionInterface};
    use crate::{MasterConfig, MasterState};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// In-memory catalog regions: the storage-server boundary without a
    /// network, shared by every "connection" the factory hands out.
    #[derive(Default)]
    struct MemoryRegions {
        regions: Mutex<HashMap<Vec<u8>, BTreeMap<Vec<u8>, CatalogRow>>>,
        scanners: Mutex<HashMap<u64, Vec<CatalogRow>>>,
        next_scanner: AtomicU64,
    }

    impl MemoryRegions {
        fn create_region(&self, name: &[u8]) {
            self.regions
                .lock()
                .unwrap()
                .entry(name.to_vec())
                .or_default();
        }

        fn put_row(&self, region: &[u8], row: CatalogRow) {
            self.regions
                .lock()
                .unwrap()
                .get_mut(region)
                .expect("region exists")
                .insert(row.row_key.clone(), row);
        }

        fn row(&self, region: &[u8], key: &[u8]) -> Option<CatalogRow> {
            self.regions
                .lock()
                .unwrap()
                .get(region)?
                .get(key)
                .cloned()
        }

        fn row_count(&self, region: &[u8]) -> usize {
            self.regions
                .lock()
                .unwrap()
                .get(region)
                .map(|rows| rows.len())
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl RegionInterface for MemoryRegions {
        async fn open_scanner(&self, region: &[u8], start_row: &[u8]) -> Result<u64> {
            let regions = self.regions.lock().unwrap();
            let rows = regions
                .get(region)
                .ok_or_else(|| MasterError::RemoteCall("no such region".to_string()))?;
            let remaining: Vec<CatalogRow> = rows
                .range(start_row.to_vec()..)
                .map(|(_, row)| row.clone())
                .collect();
            let id = self.next_scanner.fetch_add(1, Ordering::SeqCst);
            self.scanners.lock().unwrap().insert(id, remaining);
            Ok(id)
        }

        async fn next_row(&self, scanner: u64) -> Result<Option<CatalogRow>> {
            let mut scanners = self.scanners.lock().unwrap();
            let rows = scanners
                .get_mut(&scanner)
                .ok_or_else(|| MasterError::RemoteCall("no such scanner".to_string()))?;
            if rows.is_empty() {
                Ok(None)
            } else {
                Ok(Some(rows.remove(0)))
            }
        }

        async fn close_scanner(&self, scanner: u64) -> Result<()> {
            self.scanners.lock().unwrap().remove(&scanner);
            Ok(())
        }

        async fn mutate(&self, region: &[u8], mutation: CatalogMutation) -> Result<()> {
            let mut regions = self.regions.lock().unwrap();
            let rows = regions
                .get_mut(region)
                .ok_or_else(|| MasterError::RemoteCall("no such region".to_string()))?;
            if mutation.delete_row {
                rows.remove(&mutation.row_key);
                return Ok(());
            }
            let row = rows
                .entry(mutation.row_key.clone())
                .or_insert_with(|| CatalogRow::new(mutation.row_key.clone()));
            for (column, value) in mutation.put {
                row.cells.insert(column, value);
            }
            for column in mutation.delete {
                row.cells.remove(&column);
            }
            Ok(())
        }
    }

    struct MemoryFactory(Arc<MemoryRegions>);

    impl ConnectionFactory for MemoryFactory {
        fn connection(&self, _addr: SocketAddr) -> Arc<dyn RegionInterface> {
            self.0.clone()
        }
    }

    struct Fixture {
        state: Arc<MasterState>,
        regions: Arc<MemoryRegions>,
        rx: mpsc::UnboundedReceiver<QueuedOperation>,
        server: ServerIdentity,
        meta_name: Vec<u8>,
        _tmp: tempfile::TempDir,
    }

    impl Fixture {
        fn report(
            &self,
            messages: Vec<ServerStatusMessage>,
        ) -> Result<Vec<ServerInstruction>> {
            self.state
                .server_report(&self.server, ServerLoad::default(), messages)
        }

        /// Process everything currently queued, asserting each completes.
        async fn drain_ops(&mut self) {
            while let Ok(mut item) = self.rx.try_recv() {
                let status = item.op.process(&self.state).await.unwrap();
                assert_eq!(status, OpStatus::Done, "{} did not complete", item.op);
                item.op.finish(Ok(()));
            }
        }
    }

    /// A master with its catalog online against in-memory regions hosted by
    /// one registered server.
    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root_dir = tmp.path().join("fs");
        let dfs = Arc::new(LocalDfs::new(&root_dir));
        let regions = Arc::new(MemoryRegions::default());
        let config = MasterConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            root_dir,
            wake_interval: Duration::from_millis(10),
            lease_duration: Duration::from_millis(500),
            rescan_interval: Duration::from_millis(50),
            max_region_open_time: Duration::from_secs(5),
            num_retries: 2,
            drain_deadline: Duration::from_secs(2),
            rpc_timeout: Duration::from_secs(1),
        };
        let (state, rx) = MasterState::open(
            config,
            dfs.clone(),
            Arc::new(MemoryFactory(regions.clone())),
        )
        .unwrap();

        // Serve the bootstrapped catalog regions from memory.
        let root = root_region_desc();
        let meta = first_meta_region_desc();
        regions.create_region(&root.region_name());
        for row in dfs.load_rows(&root.region_name()).unwrap() {
            regions.put_row(&root.region_name(), row);
        }
        regions.create_region(&meta.region_name());

        let server = ServerIdentity {
            name: "127.0.0.1:7001".to_string(),
            address: "127.0.0.1:7001".parse().unwrap(),
            start_code: 1,
        };
        state
            .server_manager
            .startup(server.clone(), ServerLoad::default())
            .unwrap();

        let mut f = Fixture {
            state,
            regions,
            rx,
            server,
            meta_name: meta.region_name(),
            _tmp: tmp,
        };

        // Walk the real bootstrap assignment: the root goes out first and
        // alone, the root scan discovers the unserved meta region, and the
        // meta open brings the catalog fully online.
        let instructions = f.report(vec![]).unwrap();
        assert!(matches!(
            instructions.as_slice(),
            [ServerInstruction::OpenRegion(desc)] if desc.is_root()
        ));
        f.report(vec![ServerStatusMessage::RegionOpened(root.clone())])
            .unwrap();
        f.drain_ops().await;
        region_manager::scan_root(&f.state).await.unwrap();

        let instructions = f.report(vec![]).unwrap();
        assert!(matches!(
            instructions.as_slice(),
            [ServerInstruction::OpenRegion(desc)] if desc.is_meta()
        ));
        f.report(vec![ServerStatusMessage::RegionOpened(meta.clone())])
            .unwrap();
        f.drain_ops().await;
        region_manager::scan_metas(&f.state).await.unwrap();
        assert!(f.state.region_manager.catalog_ready());
        f
    }

    fn orders_schema() -> TableSchema {
        TableSchema::new("orders").with_family(ColumnSpec::new("data"))
    }

    #[tokio::test]
    async fn exactly_one_concurrent_create_succeeds() {
        let f = fixture().await;
        let (a, b) = tokio::join!(
            f.state.create_table(orders_schema()),
            f.state.create_table(orders_schema())
        );
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = outcomes.iter().find(|r| r.is_err()).unwrap();
        assert!(matches!(
            loser.as_ref().unwrap_err(),
            MasterError::TableExists(_)
        ));

        // A later create sees the catalog row and also loses.
        let err = f.state.create_table(orders_schema()).await.unwrap_err();
        assert!(matches!(err, MasterError::TableExists(_)));
    }

    #[tokio::test]
    async fn disabled_table_accepts_schema_change_without_serving_it() {
        let mut f = fixture().await;
        f.state.create_table(orders_schema()).await.unwrap();

        // The next report hands out the new region; the server opens it.
        let instructions = f.report(vec![]).unwrap();
        let desc = instructions
            .iter()
            .find_map(|i| match i {
                ServerInstruction::OpenRegion(desc) if desc.table.name == "orders" => {
                    Some(desc.clone())
                }
                _ => None,
            })
            .expect("open instruction for orders");
        f.report(vec![ServerStatusMessage::RegionOpened(desc.clone())])
            .unwrap();
        f.drain_ops().await;
        let name = desc.region_name();
        assert!(f.state.region_manager.assignment_of(&name).is_some());

        // Disable: the catalog row goes offline and a close is issued.
        let mut disable =
            Operation::change_table_state("orders".to_string(), false, MutationCtx::detached());
        assert_eq!(disable.process(&f.state).await.unwrap(), OpStatus::Done);
        let row = f.regions.row(&f.meta_name, &name).unwrap();
        assert!(row.descriptor().unwrap().offline);
        assert!(row.server().is_none());

        let instructions = f.report(vec![]).unwrap();
        assert!(instructions.iter().any(|i| matches!(
            i,
            ServerInstruction::CloseRegion { delete: false, .. }
        )));
        assert!(!instructions
            .iter()
            .any(|i| matches!(i, ServerInstruction::OpenRegion(_))));
        f.report(vec![ServerStatusMessage::RegionClosed(desc.clone())])
            .unwrap();
        f.drain_ops().await;

        // Schema change lands in the catalog while the table stays dark.
        let mut add = Operation::add_column(
            "orders".to_string(),
            ColumnSpec::new("idx"),
            MutationCtx::detached(),
        );
        assert_eq!(add.process(&f.state).await.unwrap(), OpStatus::Done);
        let row = f.regions.row(&f.meta_name, &name).unwrap();
        let stored = row.descriptor().unwrap();
        assert!(stored.offline);
        assert!(stored.table.families.contains_key("idx"));
        assert!(row.server().is_none());
        let instructions = f.report(vec![]).unwrap();
        assert!(!instructions
            .iter()
            .any(|i| matches!(i, ServerInstruction::OpenRegion(_))));

        // Re-enable: the region is put back up for assignment.
        let mut enable =
            Operation::change_table_state("orders".to_string(), true, MutationCtx::detached());
        assert_eq!(enable.process(&f.state).await.unwrap(), OpStatus::Done);
        let instructions = f.report(vec![]).unwrap();
        assert!(instructions.iter().any(|i| matches!(
            i,
            ServerInstruction::OpenRegion(desc) if desc.table.name == "orders"
        )));
    }

    #[tokio::test]
    async fn report_from_unregistered_server_is_rejected() {
        let f = fixture().await;
        let ghost = ServerIdentity {
            name: "127.0.0.1:7999".to_string(),
            address: "127.0.0.1:7999".parse().unwrap(),
            start_code: 9,
        };
        let before = f.state.server_manager.load_snapshot();
        let err = f
            .state
            .server_report(&ghost, ServerLoad::default(), vec![])
            .unwrap_err();
        assert!(matches!(err, MasterError::UnknownServer(_)));
        assert_eq!(f.state.server_manager.load_snapshot(), before);
    }

    #[tokio::test]
    async fn duplicate_startup_is_rejected() {
        let f = fixture().await;
        let err = f
            .state
            .server_manager
            .startup(f.server.clone(), ServerLoad::default())
            .unwrap_err();
        assert!(matches!(err, MasterError::DuplicateServer(_)));
        assert_eq!(f.state.server_manager.load_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn delete_table_removes_rows_and_storage() {
        let mut f = fixture().await;
        f.state.create_table(orders_schema()).await.unwrap();
        assert_eq!(f.regions.row_count(&f.meta_name), 1);
        let name = {
            let regions = f.regions.regions.lock().unwrap();
            regions[&f.meta_name].keys().next().unwrap().clone()
        };
        assert!(f.state.dfs.region_exists(&name).unwrap());

        let mut delete = Operation::delete_table("orders".to_string(), MutationCtx::detached());
        assert_eq!(delete.process(&f.state).await.unwrap(), OpStatus::Done);
        f.drain_ops().await;
        assert_eq!(f.regions.row_count(&f.meta_name), 0);
        assert!(!f.state.dfs.region_exists(&name).unwrap());

        // Idempotent surface: a second delete finds nothing.
        let mut again = Operation::delete_table("orders".to_string(), MutationCtx::detached());
        assert!(matches!(
            again.process(&f.state).await,
            Err(MasterError::TableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn modify_missing_column_is_a_precondition_error() {
        let f = fixture().await;
        f.state.create_table(orders_schema()).await.unwrap();
        let mut modify = Operation::modify_column(
            "orders".to_string(),
            "nope".to_string(),
            ColumnSpec::new("nope"),
            MutationCtx::detached(),
        );
        assert!(matches!(
            modify.process(&f.state).await,
            Err(MasterError::ColumnNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn server_recovery_waits_for_regions_to_reopen_elsewhere() {
        let mut f = fixture().await;
        f.state.create_table(orders_schema()).await.unwrap();

        // A second server joins and takes the user region.
        let other = ServerIdentity {
            name: "127.0.0.1:7002".to_string(),
            address: "127.0.0.1:7002".parse().unwrap(),
            start_code: 2,
        };
        f.state
            .server_manager
            .startup(other.clone(), ServerLoad::default())
            .unwrap();
        let instructions = f
            .state
            .server_report(&other, ServerLoad::default(), vec![])
            .unwrap();
        let desc = instructions
            .iter()
            .find_map(|i| match i {
                ServerInstruction::OpenRegion(desc) if desc.table.name == "orders" => {
                    Some(desc.clone())
                }
                _ => None,
            })
            .expect("open instruction for orders");
        f.state
            .server_report(
                &other,
                ServerLoad::default(),
                vec![ServerStatusMessage::RegionOpened(desc.clone())],
            )
            .unwrap();
        f.drain_ops().await;
        let name = desc.region_name();
        assert_eq!(
            f.state.region_manager.assignment_of(&name).unwrap().server,
            other.key()
        );

        // The second server dies; recovery blocks until the region is
        // confirmed open on a different live server.
        f.state.server_manager.schedule_recovery(other.clone());
        let mut recovery = f.rx.try_recv().expect("recovery queued").op;
        assert_eq!(recovery.process(&f.state).await.unwrap(), OpStatus::Blocked);
        assert!(f.state.region_manager.is_unassigned(&name));

        let instructions = f.report(vec![]).unwrap();
        assert!(instructions
            .iter()
            .any(|i| matches!(i, ServerInstruction::OpenRegion(_))));
        f.report(vec![ServerStatusMessage::RegionOpened(desc.clone())])
            .unwrap();
        f.drain_ops().await;

        assert_eq!(recovery.process(&f.state).await.unwrap(), OpStatus::Done);
        let servers = f.state.server_manager.load_snapshot();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].0.starts_with("127.0.0.1:7001"));
    }
}
