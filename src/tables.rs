//! Derived tables written as CSV files in an output directory
//!
//! A pass writes every table into a staging directory next to the output
//! directory and only swaps it into place once all tables were written. A
//! failed pass leaves the previous tables untouched.

use anyhow::{Context, Result};
use csv::{Reader, Writer};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const TABLE_EXTENSION: &str = "csv";

/// Name, size and columns of one stored table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub row_count: usize,
    pub columns: Vec<String>,
}

/// Directory of derived tables
#[derive(Debug, Clone)]
pub struct AnalyticalStore {
    root: PathBuf,
}

impl AnalyticalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{TABLE_EXTENSION}"))
    }

    /// Start a replace-on-success write of a new set of tables
    pub fn stage(&self) -> Result<TableStaging> {
        let parent = self
            .root
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .context(format!("Failed to create {}", parent.display()))?;

        let dir_name = self
            .root
            .file_name()
            .and_then(|n| n.to_str())
            .context("Output directory has no name")?;
        let staging = parent.join(format!(".{}.staging-{}", dir_name, uuid::Uuid::new_v4()));
        fs::create_dir(&staging)
            .context(format!("Failed to create staging directory {}", staging.display()))?;

        debug!("Staging derived tables in {}", staging.display());
        Ok(TableStaging {
            staging,
            target: self.root.clone(),
            tables: Vec::new(),
            committed: false,
        })
    }

    /// Read a whole table back
    pub fn read_table<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.table_path(name);
        let mut reader = Reader::from_path(&path)
            .context(format!("Failed to open table {}", path.display()))?;
        reader
            .deserialize()
            .collect::<std::result::Result<Vec<T>, _>>()
            .context(format!("Failed to parse table {}", path.display()))
    }

    /// List tables with row counts and columns, sorted by name
    pub fn inspect(&self) -> Result<Vec<TableInfo>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut tables = Vec::new();
        for entry in fs::read_dir(&self.root)
            .context(format!("Failed to list {}", self.root.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TABLE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let mut reader = Reader::from_path(&path)
                .context(format!("Failed to open table {}", path.display()))?;
            let columns = reader
                .headers()
                .context(format!("Failed to read header of {}", path.display()))?
                .iter()
                .map(str::to_string)
                .collect();
            let mut row_count = 0;
            for record in reader.records() {
                record.context(format!("Failed to read {}", path.display()))?;
                row_count += 1;
            }

            tables.push(TableInfo {
                name: name.to_string(),
                row_count,
                columns,
            });
        }

        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tables)
    }
}

/// Tables written so far in one pass; dropped without commit means discarded
pub struct TableStaging {
    staging: PathBuf,
    target: PathBuf,
    tables: Vec<String>,
    committed: bool,
}

impl TableStaging {
    /// Write one table; returns the number of rows written
    pub fn write_table<T: Serialize>(&mut self, name: &str, rows: &[T]) -> Result<usize> {
        let path = self.staging.join(format!("{name}.{TABLE_EXTENSION}"));
        let mut writer =
            Writer::from_path(&path).context(format!("Failed to create {}", path.display()))?;
        for row in rows {
            writer
                .serialize(row)
                .context(format!("Failed to write row to table {}", name))?;
        }
        writer
            .flush()
            .context(format!("Failed to flush table {}", name))?;

        info!("Wrote table {} with {} rows", name, rows.len());
        self.tables.push(name.to_string());
        Ok(rows.len())
    }

    /// Swap the staged tables into place
    pub fn commit(mut self) -> Result<()> {
        let previous = if self.target.exists() {
            let file_name = self
                .target
                .file_name()
                .and_then(|n| n.to_str())
                .context("Output directory has no name")?;
            let backup = self
                .target
                .with_file_name(format!(".{}.previous-{}", file_name, uuid::Uuid::new_v4()));
            fs::rename(&self.target, &backup).context(format!(
                "Failed to move {} aside",
                self.target.display()
            ))?;
            Some(backup)
        } else {
            None
        };

        if let Err(e) = fs::rename(&self.staging, &self.target) {
            if let Some(backup) = &previous
                && let Err(restore) = fs::rename(backup, &self.target)
            {
                warn!(
                    "Failed to restore previous tables from {}: {}",
                    backup.display(),
                    restore
                );
            }
            return Err(e).context(format!(
                "Failed to move staged tables into {}",
                self.target.display()
            ));
        }
        self.committed = true;

        if let Some(backup) = previous
            && let Err(e) = fs::remove_dir_all(&backup)
        {
            warn!("Failed to remove {}: {}", backup.display(), e);
        }

        info!(
            "Replaced {} derived tables in {}",
            self.tables.len(),
            self.target.display()
        );
        Ok(())
    }
}

impl Drop for TableStaging {
    fn drop(&mut self) {
        if !self.committed && self.staging.exists() {
            debug!("Discarding staged tables in {}", self.staging.display());
            if let Err(e) = fs::remove_dir_all(&self.staging) {
                warn!("Failed to remove {}: {}", self.staging.display(), e);
            }
        }
    }
}
