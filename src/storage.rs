use crate::series::TimeSeriesRecord;
use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Destination of drained output groups. Called once per group, with every
/// record of the run in arrival order.
pub trait StorageWriter: Send {
    fn write(&mut self, group: &str, records: &[TimeSeriesRecord]) -> Result<()>;
}

/// Writes each group to `<dir>/<prefix><group>.sto` in the format
/// [`TimeSeriesReader`](crate::series::TimeSeriesReader) parses.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
    prefix: String,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: String::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn path_for(&self, group: &str) -> PathBuf {
        self.dir.join(format!("{}{group}.sto", self.prefix))
    }

    fn write_file(path: &Path, records: &[TimeSeriesRecord]) -> Result<()> {
        let names = records.first().map(|r| r.names()).unwrap_or_default();

        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "nColumns {} nRows {}", names.len() + 1, records.len())?;
        writeln!(out)?;
        write!(out, "time")?;
        for name in names {
            write!(out, "\t{name}")?;
        }
        writeln!(out)?;

        for (i, rec) in records.iter().enumerate() {
            if rec.names() != names {
                bail!("row {i} changes the column set");
            }
            write!(out, "{}", rec.time())?;
            for v in rec.values() {
                write!(out, "\t{v}")?;
            }
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }
}

impl StorageWriter for FileStorage {
    fn write(&mut self, group: &str, records: &[TimeSeriesRecord]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path_for(group);
        Self::write_file(&path, records)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!("[Storage] {} rows -> {}", records.len(), path.display());
        Ok(())
    }
}

/// In-memory storage; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    groups: Arc<Mutex<BTreeMap<String, Vec<TimeSeriesRecord>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, group: &str) -> Option<Vec<TimeSeriesRecord>> {
        self.groups.lock().get(group).cloned()
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.lock().keys().cloned().collect()
    }
}

impl StorageWriter for MemoryStorage {
    fn write(&mut self, group: &str, records: &[TimeSeriesRecord]) -> Result<()> {
        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::TimeSeriesReader;

    #[test]
    fn written_files_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).with_prefix("run_");

        let first = TimeSeriesRecord::from_pairs(0.0, [("soleus", 0.25), ("tibant", 1.5)]);
        let rows = vec![first.clone(), first.with_values(0.01, vec![0.5, -2.0]).unwrap()];
        storage.write("Activations", &rows).unwrap();

        let path = storage.path_for("Activations");
        assert!(path.ends_with("run_Activations.sto"));
        let back: Vec<_> = TimeSeriesReader::open(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn empty_group_still_produces_a_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("nested"));
        storage.write("Torques", &[]).unwrap();

        let r = TimeSeriesReader::open(storage.path_for("Torques")).unwrap();
        assert_eq!(r.total_steps(), 0);
        assert!(r.names().is_empty());
    }

    #[test]
    fn memory_storage_clones_share_records() {
        let storage = MemoryStorage::new();
        let mut writer = storage.clone();
        let rec = TimeSeriesRecord::from_pairs(0.0, [("a", 1.0)]);
        writer.write("G", &[rec.clone()]).unwrap();
        assert_eq!(storage.records("G"), Some(vec![rec]));
        assert_eq!(storage.groups(), vec!["G".to_string()]);
    }
}
