//! Catalog data model: table schemas, region descriptors, and the rows the
//! master reads and writes in the root/meta catalog regions.
//!
//! The catalog is a two-level index. The root region holds one row per meta
//! region; each meta region holds one row per data region of the user
//! tables whose key range it covers. A row is keyed by the region name
//! (`table,start_key,region_id`) and carries the serialized descriptor plus
//! the hosting server address and start code.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};

/// Table name of the root catalog region. Names starting with '.' are
/// reserved and rejected for user tables.
pub const ROOT_TABLE: &str = ".root";
/// Table name of the meta catalog regions.
pub const META_TABLE: &str = ".meta";

/// Column holding the serialized `RegionDescriptor`.
pub const COL_REGIONINFO: &str = "info:regioninfo";
/// Column holding the hosting server's catalog-protocol address.
pub const COL_SERVER: &str = "info:server";
/// Column holding the hosting server's start code.
pub const COL_STARTCODE: &str = "info:startcode";

/// Per-family schema settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub family: String,
    pub max_versions: u32,
    pub in_memory: bool,
}

impl ColumnSpec {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            max_versions: 3,
            in_memory: false,
        }
    }
}

/// Schema of one table: its name plus the column families it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub families: BTreeMap<String, ColumnSpec>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            families: BTreeMap::new(),
        }
    }

    pub fn with_family(mut self, spec: ColumnSpec) -> Self {
        self.families.insert(spec.family.clone(), spec);
        self
    }

    pub fn is_catalog(&self) -> bool {
        self.name == ROOT_TABLE || self.name == META_TABLE
    }

    /// A legal user table name: non-empty, no region-name delimiter, and not
    /// in the reserved '.' namespace.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(',') {
            return Err(MasterError::InvalidTableName(self.name.clone()));
        }
        if self.name.starts_with('.') {
            return Err(MasterError::InvalidTableName(self.name.clone()));
        }
        if self.families.is_empty() {
            return Err(MasterError::InvalidTableName(format!(
                "{} has no column families",
                self.name
            )));
        }
        Ok(())
    }
}

/// Identity and schema of one region. Immutable once named; schema changes
/// and splits produce rewritten descriptor rows, never in-place edits of an
/// assigned region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    /// Creation timestamp in unix milliseconds; part of the region name.
    pub region_id: u64,
    pub table: TableSchema,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    /// Set when the table is disabled or the region was split away.
    pub offline: bool,
    /// Set on a parent region that has been split into daughters.
    pub split: bool,
}

impl RegionDescriptor {
    pub fn new(table: TableSchema, start_key: Vec<u8>, end_key: Vec<u8>) -> Self {
        Self::with_id(unix_time_millis(), table, start_key, end_key)
    }

    pub fn with_id(
        region_id: u64,
        table: TableSchema,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
    ) -> Self {
        Self {
            region_id,
            table,
            start_key,
            end_key,
            offline: false,
            split: false,
        }
    }

    /// `table,start_key,region_id` as raw bytes. Lexicographic order on the
    /// name groups a table's regions together, ordered by start key.
    pub fn region_name(&self) -> Vec<u8> {
        let mut name = Vec::with_capacity(self.table.name.len() + self.start_key.len() + 24);
        name.extend_from_slice(self.table.name.as_bytes());
        name.push(b',');
        name.extend_from_slice(&self.start_key);
        name.push(b',');
        name.extend_from_slice(self.region_id.to_string().as_bytes());
        name
    }

    pub fn is_root(&self) -> bool {
        self.table.name == ROOT_TABLE
    }

    pub fn is_meta(&self) -> bool {
        self.table.name == META_TABLE
    }

    pub fn is_catalog(&self) -> bool {
        self.table.is_catalog()
    }

    pub fn encode(&self) -> Vec<u8> {
        // Descriptors are plain serde structs; encoding cannot fail.
        bincode::serialize(self).expect("region descriptor serialization")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|err| MasterError::RemoteCall(format!("bad region descriptor: {err}")))
    }
}

/// The root catalog region descriptor. Created once at cluster genesis.
pub fn root_region_desc() -> RegionDescriptor {
    let table = TableSchema::new(ROOT_TABLE).with_family(ColumnSpec::new("info"));
    RegionDescriptor::with_id(0, table, Vec::new(), Vec::new())
}

/// The first meta catalog region descriptor. Created once at cluster genesis
/// alongside the root region.
pub fn first_meta_region_desc() -> RegionDescriptor {
    let table = TableSchema::new(META_TABLE).with_family(ColumnSpec::new("info"));
    RegionDescriptor::with_id(1, table, Vec::new(), Vec::new())
}

/// Table-name prefix of a region name (everything before the first ',').
pub fn table_name_of(region_name: &[u8]) -> &[u8] {
    match region_name.iter().position(|b| *b == b',') {
        Some(idx) => &region_name[..idx],
        None => region_name,
    }
}

/// One catalog row as returned by a scanner: row key plus column cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub row_key: Vec<u8>,
    pub cells: BTreeMap<String, Vec<u8>>,
}

impl CatalogRow {
    pub fn new(row_key: Vec<u8>) -> Self {
        Self {
            row_key,
            cells: BTreeMap::new(),
        }
    }

    /// Decode the descriptor cell. Rows without one are garbage the scanners
    /// skip over; the caller logs them.
    pub fn descriptor(&self) -> Option<RegionDescriptor> {
        let bytes = self.cells.get(COL_REGIONINFO)?;
        RegionDescriptor::decode(bytes).ok()
    }

    pub fn server(&self) -> Option<SocketAddr> {
        let bytes = self.cells.get(COL_SERVER)?;
        std::str::from_utf8(bytes).ok()?.parse().ok()
    }

    pub fn start_code(&self) -> Option<u64> {
        let bytes = self.cells.get(COL_STARTCODE)?;
        std::str::from_utf8(bytes).ok()?.parse().ok()
    }
}

/// A batched edit against one catalog row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogMutation {
    pub row_key: Vec<u8>,
    pub put: BTreeMap<String, Vec<u8>>,
    pub delete: Vec<String>,
    pub delete_row: bool,
}

impl CatalogMutation {
    pub fn put(row_key: Vec<u8>) -> Self {
        Self {
            row_key,
            ..Default::default()
        }
    }

    pub fn delete_row(row_key: Vec<u8>) -> Self {
        Self {
            row_key,
            delete_row: true,
            ..Default::default()
        }
    }

    pub fn set(mut self, column: &str, value: Vec<u8>) -> Self {
        self.put.insert(column.to_string(), value);
        self
    }

    pub fn clear(mut self, column: &str) -> Self {
        self.delete.push(column.to_string());
        self
    }

    pub fn set_descriptor(self, desc: &RegionDescriptor) -> Self {
        self.set(COL_REGIONINFO, desc.encode())
    }

    pub fn set_assignment(self, server: SocketAddr, start_code: u64) -> Self {
        self.set(COL_SERVER, server.to_string().into_bytes())
            .set(COL_STARTCODE, start_code.to_string().into_bytes())
    }

    pub fn clear_assignment(self) -> Self {
        self.clear(COL_SERVER).clear(COL_STARTCODE)
    }
}

/// Location fact for one online catalog region: where it is served from and
/// which slice of the catalog keyspace it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRegionLocation {
    pub region_name: Vec<u8>,
    pub start_key: Vec<u8>,
    pub server: SocketAddr,
}

/// Select the meta region whose key range covers `row`, by search over the
/// start-key-ordered location map. At most one location is authoritative per
/// region name; a stale entry is corrected by the next catalog scan.
pub fn covering_meta<'a>(
    metas: &'a BTreeMap<Vec<u8>, MetaRegionLocation>,
    row: &[u8],
) -> Option<&'a MetaRegionLocation> {
    metas
        .range(..=row.to_vec())
        .next_back()
        .map(|(_, loc)| loc)
        .or_else(|| metas.values().next())
}

pub fn unix_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
