//! Materialized row storage: the container table and its archive format.
//!
//! A [`ContainerTable`] holds fully materialized rows and can be written to a
//! single compressed archive file and rehydrated from it. [`DataContainer`]
//! is how lazily produced row sequences become container tables; it polls the
//! progress monitor so long materializations stay cancelable.
//!
//! Archive layout (gzip stream): bincode-encoded spec, row count, then each
//! row in order. Writing polls cancellation between row batches; a canceled
//! write leaves a partial file behind, which callers accept.

use crate::context::{CanceledError, ProgressMonitor};
use crate::data::{Row, TableSpec};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Rows between two cancellation polls during archive writes.
const CANCEL_POLL_INTERVAL: usize = 512;

/// Error type for container materialization and archive I/O.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("row '{key}' has {actual} cells, spec has {expected} columns")]
    CellCountMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Canceled(#[from] CanceledError),
}

/// A fully materialized table: spec plus rows, archivable to one file.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerTable {
    spec: TableSpec,
    rows: Vec<Row>,
}

impl ContainerTable {
    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    /// Writes the table to `path` as a compressed archive. Polls `monitor`
    /// between row batches and aborts with the distinct cancellation error;
    /// a partial file is left in place in that case.
    pub fn save_archive(
        &self,
        path: &Path,
        monitor: &ProgressMonitor,
    ) -> Result<(), ContainerError> {
        monitor.check_canceled()?;
        let file = File::create(path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        bincode::serialize_into(&mut encoder, &self.spec)?;
        bincode::serialize_into(&mut encoder, &(self.rows.len() as u64))?;
        let total = self.rows.len().max(1);
        for (i, row) in self.rows.iter().enumerate() {
            if i % CANCEL_POLL_INTERVAL == 0 {
                monitor.check_canceled()?;
                monitor.set_progress(i as f64 / total as f64);
            }
            bincode::serialize_into(&mut encoder, row)?;
        }
        encoder.finish()?.flush()?;
        monitor.set_progress(1.0);
        Ok(())
    }

    /// Reads a table previously written with
    /// [`save_archive`](Self::save_archive).
    pub fn read_archive(path: &Path) -> Result<ContainerTable, ContainerError> {
        let file = File::open(path)?;
        let mut decoder = GzDecoder::new(BufReader::new(file));
        let spec: TableSpec = bincode::deserialize_from(&mut decoder)?;
        let count: u64 = bincode::deserialize_from(&mut decoder)?;
        let mut rows = Vec::with_capacity(count as usize);
        for _ in 0..count {
            rows.push(bincode::deserialize_from(&mut decoder)?);
        }
        Ok(ContainerTable { spec, rows })
    }
}

/// Collects rows against a fixed spec and closes into a [`ContainerTable`].
#[derive(Debug)]
pub struct DataContainer {
    spec: TableSpec,
    rows: Vec<Row>,
}

impl DataContainer {
    pub fn new(spec: TableSpec) -> Self {
        DataContainer {
            spec,
            rows: Vec::new(),
        }
    }

    /// Appends a row; the cell count must match the spec.
    pub fn add_row(&mut self, row: Row) -> Result<(), ContainerError> {
        let actual = row.cells.len();
        if actual != self.spec.num_columns() {
            return Err(ContainerError::CellCountMismatch {
                key: row.key,
                expected: self.spec.num_columns(),
                actual,
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn close(self) -> ContainerTable {
        ContainerTable {
            spec: self.spec,
            rows: self.rows,
        }
    }

    /// Materializes a lazy row sequence into a container table, polling the
    /// monitor once per row.
    pub fn cache(
        spec: TableSpec,
        rows: impl IntoIterator<Item = Row>,
        monitor: &ProgressMonitor,
    ) -> Result<ContainerTable, ContainerError> {
        let mut container = DataContainer::new(spec);
        for row in rows {
            monitor.check_canceled()?;
            container.add_row(row)?;
        }
        Ok(container.close())
    }
}

/// Copies `src` to `dest` in chunks, polling the monitor per chunk. Returns
/// the number of bytes copied.
pub fn copy_file_with_progress(
    src: &Path,
    dest: &Path,
    monitor: &ProgressMonitor,
) -> Result<u64, ContainerError> {
    let total = src.metadata()?.len().max(1);
    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dest)?);
    let mut buf = [0u8; 8192];
    let mut copied: u64 = 0;
    loop {
        monitor.check_canceled()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        copied += n as u64;
        monitor.set_progress(copied as f64 / total as f64);
    }
    writer.flush()?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Cell, Column, ColumnType};
    use tempfile::tempdir;

    fn sample_spec() -> TableSpec {
        TableSpec::new(vec![
            Column::new("id", ColumnType::Int),
            Column::new("value", ColumnType::Double),
        ])
    }

    fn sample_rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                Row::new(
                    format!("row{}", i),
                    vec![Cell::Int(i as i64), Cell::Double(i as f64 * 0.5)],
                )
            })
            .collect()
    }

    #[test]
    fn test_container_materialization() {
        let monitor = ProgressMonitor::new();
        let table = DataContainer::cache(sample_spec(), sample_rows(10), &monitor).unwrap();
        assert_eq!(table.row_count(), 10);
        assert_eq!(table.spec().num_columns(), 2);
        assert_eq!(table.rows()[3].cells[0], Cell::Int(3));
    }

    #[test]
    fn test_add_row_rejects_wrong_arity() {
        let mut container = DataContainer::new(sample_spec());
        let err = container
            .add_row(Row::new("bad", vec![Cell::Int(1)]))
            .unwrap_err();
        assert!(matches!(err, ContainerError::CellCountMismatch { .. }));
    }

    #[test]
    fn test_cache_aborts_on_cancel() {
        let monitor = ProgressMonitor::new();
        monitor.cancel();
        let err = DataContainer::cache(sample_spec(), sample_rows(3), &monitor).unwrap_err();
        assert!(matches!(err, ContainerError::Canceled(_)));
    }

    #[test]
    fn test_archive_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let monitor = ProgressMonitor::new();
        let table = DataContainer::cache(sample_spec(), sample_rows(100), &monitor).unwrap();

        table.save_archive(&path, &monitor).unwrap();
        let restored = ContainerTable::read_archive(&path).unwrap();
        assert_eq!(restored, table);
        assert_eq!(monitor.progress(), 1.0);
    }

    #[test]
    fn test_save_archive_aborts_on_cancel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let monitor = ProgressMonitor::new();
        let table = DataContainer::cache(sample_spec(), sample_rows(5), &monitor).unwrap();
        monitor.cancel();
        let err = table.save_archive(&path, &monitor).unwrap_err();
        assert!(matches!(err, ContainerError::Canceled(_)));
    }

    #[test]
    fn test_copy_with_progress() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dest = dir.path().join("dest.bin");
        std::fs::write(&src, vec![7u8; 20_000]).unwrap();

        let monitor = ProgressMonitor::new();
        let copied = copy_file_with_progress(&src, &dest, &monitor).unwrap();
        assert_eq!(copied, 20_000);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 20_000]);
        assert_eq!(monitor.progress(), 1.0);
    }

    #[test]
    fn test_copy_aborts_on_cancel() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"payload").unwrap();
        let monitor = ProgressMonitor::new();
        monitor.cancel();
        let err =
            copy_file_with_progress(&src, &dir.path().join("dest.bin"), &monitor).unwrap_err();
        assert!(matches!(err, ContainerError::Canceled(_)));
    }
}
