//! Snapshot cache backed by redb.
//!
//! One table, `snapshots`: cache key → snapshot JSON. Shared by the engine
//! (read/write) and the `skein-cache` inspector binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};

use super::KeyValueBackend;

const SNAPSHOTS: TableDefinition<&str, &str> = TableDefinition::new("snapshots");

pub struct DiskBackend {
    db: Database,
}

impl DiskBackend {
    /// Open or create the cache file, making sure the table exists.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db = Database::create(path)
            .with_context(|| format!("failed to open cache redb at {}", path.display()))?;
        {
            let txn = db.begin_write()?;
            txn.open_table(SNAPSHOTS)?;
            txn.commit()?;
        }
        Ok(Self { db })
    }

    /// Default location: `<data_dir>/skein/cache.redb`
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join("skein");
        Ok(data_dir.join("cache.redb"))
    }
}

impl KeyValueBackend for DiskBackend {
    fn backend_name(&self) -> &str {
        "redb"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SNAPSHOTS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SNAPSHOTS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SNAPSHOTS)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SNAPSHOTS)?;
        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (k, _) = entry?;
            keys.push(k.value().to_string());
        }
        Ok(keys)
    }
}
