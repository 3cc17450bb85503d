//! Distributed-filesystem collaborator boundary.
//!
//! The master touches the filesystem in exactly two situations: catalog
//! bootstrap (create the root/meta region storage and seed the root region's
//! sole row) and the "is storage still reachable" probe the control loop
//! runs after a failed remote call. Everything else about region storage
//! belongs to the storage servers.
//!
//! `LocalDfs` lays a region out as a directory containing `descriptor.json`
//! and an optional `rows.jsonl` seed file; storage servers opening a region
//! load any seed rows from the same layout.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogRow, RegionDescriptor};

/// Version stamped into a fresh filesystem root. A mismatch on an existing
/// root refuses startup: the data needs migrating first.
pub const FILE_SYSTEM_VERSION: &str = "0.1";

const VERSION_FILE: &str = "tessera.version";
const REGIONS_DIR: &str = "regions";
const DESCRIPTOR_FILE: &str = "descriptor.json";
const ROWS_FILE: &str = "rows.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct VersionStamp {
    version: String,
}

pub trait Dfs: Send + Sync {
    fn root_exists(&self) -> anyhow::Result<bool>;
    fn create_root(&self) -> anyhow::Result<()>;
    fn read_version(&self) -> anyhow::Result<Option<String>>;
    fn write_version(&self) -> anyhow::Result<()>;
    fn region_exists(&self, region_name: &[u8]) -> anyhow::Result<bool>;
    fn create_region(&self, desc: &RegionDescriptor) -> anyhow::Result<()>;
    fn delete_region(&self, region_name: &[u8]) -> anyhow::Result<()>;
    fn delete_family(&self, region_name: &[u8], family: &str) -> anyhow::Result<()>;
    /// Bootstrap-only: append a row to a region's seed file so the first
    /// server to open it serves the row.
    fn seed_catalog_row(&self, region_name: &[u8], row: &CatalogRow) -> anyhow::Result<()>;
    /// Cheap reachability probe; false promotes a failed remote call to a
    /// fatal shutdown.
    fn available(&self) -> bool;
    /// URI handed to storage servers in the startup configuration subset.
    fn uri(&self) -> String;
}

/// Filesystem layout rooted at a local directory. Stands in for a
/// distributed filesystem mount in tests and local mode.
pub struct LocalDfs {
    root: PathBuf,
}

impl LocalDfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn region_dir(&self, region_name: &[u8]) -> PathBuf {
        self.root
            .join(REGIONS_DIR)
            .join(encode_dir_name(region_name))
    }

    /// Load a region's durable rows, sorted by row key. Storage servers use
    /// this when opening a region; bootstrap-seeded rows land in the same
    /// file.
    pub fn load_rows(&self, region_name: &[u8]) -> anyhow::Result<Vec<CatalogRow>> {
        let path = self.region_dir(region_name).join(ROWS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("read region rows {}", path.display()))?;
        let mut rows = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            rows.push(serde_json::from_str::<CatalogRow>(line).context("decode region row")?);
        }
        rows.sort_by(|a, b| a.row_key.cmp(&b.row_key));
        Ok(rows)
    }

    /// Replace a region's durable rows. The write side of the storage-server
    /// contract `load_rows` reads from.
    pub fn store_rows(&self, region_name: &[u8], rows: &[CatalogRow]) -> anyhow::Result<()> {
        let path = self.region_dir(region_name).join(ROWS_FILE);
        let mut data = Vec::new();
        for row in rows {
            data.extend_from_slice(&serde_json::to_vec(row).context("encode region row")?);
            data.push(b'\n');
        }
        fs::write(&path, data).with_context(|| format!("write region rows {}", path.display()))
    }
}

impl Dfs for LocalDfs {
    fn root_exists(&self) -> anyhow::Result<bool> {
        Ok(self.root.exists())
    }

    fn create_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(self.root.join(REGIONS_DIR))
            .with_context(|| format!("create filesystem root {}", self.root.display()))
    }

    fn read_version(&self) -> anyhow::Result<Option<String>> {
        let path = self.root.join(VERSION_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path).context("read version stamp")?;
        let stamp: VersionStamp = serde_json::from_str(&data).context("decode version stamp")?;
        Ok(Some(stamp.version))
    }

    fn write_version(&self) -> anyhow::Result<()> {
        let stamp = VersionStamp {
            version: FILE_SYSTEM_VERSION.to_string(),
        };
        fs::write(
            self.root.join(VERSION_FILE),
            serde_json::to_vec(&stamp).context("encode version stamp")?,
        )
        .context("write version stamp")
    }

    fn region_exists(&self, region_name: &[u8]) -> anyhow::Result<bool> {
        Ok(self.region_dir(region_name).join(DESCRIPTOR_FILE).exists())
    }

    fn create_region(&self, desc: &RegionDescriptor) -> anyhow::Result<()> {
        let dir = self.region_dir(&desc.region_name());
        fs::create_dir_all(&dir).with_context(|| format!("create region {}", dir.display()))?;
        fs::write(
            dir.join(DESCRIPTOR_FILE),
            serde_json::to_vec_pretty(desc).context("encode region descriptor")?,
        )
        .context("write region descriptor")
    }

    fn delete_region(&self, region_name: &[u8]) -> anyhow::Result<()> {
        let dir = self.region_dir(region_name);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("delete region {}", dir.display()))?;
        }
        Ok(())
    }

    fn delete_family(&self, region_name: &[u8], family: &str) -> anyhow::Result<()> {
        let dir = self.region_dir(region_name).join(family);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("delete column family {}", dir.display()))?;
        }
        Ok(())
    }

    fn seed_catalog_row(&self, region_name: &[u8], row: &CatalogRow) -> anyhow::Result<()> {
        let path = self.region_dir(region_name).join(ROWS_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open seed rows {}", path.display()))?;
        let mut line = serde_json::to_vec(row).context("encode seed row")?;
        line.push(b'\n');
        file.write_all(&line).context("append seed row")
    }

    fn available(&self) -> bool {
        self.root.exists()
    }

    fn uri(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

/// Region names embed raw key bytes; map them onto a filesystem-safe
/// directory name.
fn encode_dir_name(name: &[u8]) -> String {
    let mut out = String::with_capacity(name.len() * 2);
    for b in name {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => out.push(*b as char),
            other => {
                out.push('%');
                out.push_str(&format!("{other:02x}"));
            }
        }
    }
    out
}
