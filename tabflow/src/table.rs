//! Table handles and the reference graph.
//!
//! A [`TableHandle`] is the identity-carrying wrapper that travels along the
//! workflow: it delegates to one of three backends — a materialized
//! [`ContainerTable`], a column projection over another handle, or a spec
//! replacement over another handle. The two view backends each reference
//! exactly one upstream handle, so reference chains form a DAG in which every
//! node has at most one outgoing edge and every chain ends at a materialized
//! root.
//!
//! Save and load walk that chain iteratively. A reference owned by the same
//! node as its dependent is written once into a fixed-name subdirectory; a
//! reference owned elsewhere is recorded as an explicit absence marker and
//! resolved through the load-session repository instead, which is what keeps
//! a physically shared table on disk exactly once.

use crate::container::{copy_file_with_progress, ContainerError, ContainerTable, DataContainer};
use crate::context::{CanceledError, NodeId, ProgressMonitor};
use crate::data::{Row, TableSpec};
use crate::repository::{RepositoryError, SessionId, TableRepository};
use crate::settings::{Settings, SettingsError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Process-unique table identity.
pub type TableId = u64;

const CFG_TABLE_META: &str = "table_meta_info";
const CFG_TABLE_REFERENCE: &str = "table_reference";
const CFG_TABLE_TYPE: &str = "table_type";
const CFG_TABLE_ID: &str = "table_ID";
const CFG_TABLE_FILE_NAME: &str = "table_file_name";
const CFG_REFERENCE_ID: &str = "table_reference_ID";
const TABLE_TYPE_CONTAINER: &str = "container_table";
const TABLE_TYPE_REARRANGE_COLUMN: &str = "rearrange_columns_table";
const TABLE_TYPE_NEW_SPEC: &str = "new_spec_table";
const TABLE_SUB_DIR: &str = "reference";
const TABLE_FILE: &str = "data.bin";

/// Error type for table construction, save and load.
#[derive(Debug, Error)]
pub enum TableError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Container(ContainerError),
    #[error(transparent)]
    Canceled(#[from] CanceledError),
    #[error("unknown table type tag '{0}'")]
    UnknownTableType(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("column index {index} out of range for reference table with {columns} columns")]
    ColumnIndexOutOfRange { index: usize, columns: usize },
    #[error("replacement spec has {actual} columns, reference table has {expected}")]
    SpecColumnMismatch { expected: usize, actual: usize },
}

/// Column projection view: reorders or drops columns of its reference table
/// without touching the row data.
#[derive(Debug)]
pub struct ProjectedTable {
    reference: Arc<TableHandle>,
    permutation: Vec<usize>,
    spec: TableSpec,
}

impl ProjectedTable {
    fn new(reference: Arc<TableHandle>, permutation: Vec<usize>) -> Result<Self, TableError> {
        let reference_spec = reference.spec();
        let mut columns = Vec::with_capacity(permutation.len());
        for &index in &permutation {
            match reference_spec.column(index) {
                Some(column) => columns.push(column.clone()),
                None => {
                    return Err(TableError::ColumnIndexOutOfRange {
                        index,
                        columns: reference_spec.num_columns(),
                    })
                }
            }
        }
        let spec = TableSpec::new(columns);
        Ok(ProjectedTable {
            reference,
            permutation,
            spec,
        })
    }

    pub fn reference(&self) -> &Arc<TableHandle> {
        &self.reference
    }

    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    pub fn row_count(&self) -> u64 {
        self.reference.row_count()
    }

    fn project_row(&self, row: Row) -> Row {
        let cells = self
            .permutation
            .iter()
            .map(|&index| row.cells[index].clone())
            .collect();
        Row {
            key: row.key,
            cells,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Row> + '_ {
        self.reference.iter().map(|row| self.project_row(row))
    }

    fn save_archive(&self, path: &Path) -> Result<(), TableError> {
        write_view_blob(path, &self.permutation)
    }

    fn read_archive(path: &Path, reference: Arc<TableHandle>) -> Result<Self, TableError> {
        let permutation: Vec<usize> = read_view_blob(path)?;
        Self::new(reference, permutation)
    }
}

/// Spec replacement view: keeps the rows of its reference table and presents
/// them under a new schema descriptor (same column count).
#[derive(Debug)]
pub struct RespecTable {
    reference: Arc<TableHandle>,
    spec: TableSpec,
}

impl RespecTable {
    fn new(reference: Arc<TableHandle>, spec: TableSpec) -> Result<Self, TableError> {
        let expected = reference.spec().num_columns();
        if spec.num_columns() != expected {
            return Err(TableError::SpecColumnMismatch {
                expected,
                actual: spec.num_columns(),
            });
        }
        Ok(RespecTable { reference, spec })
    }

    pub fn reference(&self) -> &Arc<TableHandle> {
        &self.reference
    }

    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    pub fn row_count(&self) -> u64 {
        self.reference.row_count()
    }

    pub fn iter(&self) -> impl Iterator<Item = Row> + '_ {
        self.reference.iter()
    }

    fn save_archive(&self, path: &Path) -> Result<(), TableError> {
        write_view_blob(path, &self.spec)
    }

    fn read_archive(path: &Path, reference: Arc<TableHandle>) -> Result<Self, TableError> {
        let spec: TableSpec = read_view_blob(path)?;
        Self::new(reference, spec)
    }
}

/// The closed set of backends a handle can delegate to. Only the two view
/// variants carry a reference to another handle.
#[derive(Debug)]
pub enum TableBackend {
    Container(ContainerTable),
    Projected(ProjectedTable),
    Respec(RespecTable),
}

/// Identity- and ownership-carrying wrapper around a table backend.
///
/// Handles are shared via `Arc` and never mutated after construction; the
/// owner is a set-once slot filled by
/// [`set_owner_recursively`](Self::set_owner_recursively) when a node claims
/// its output tables.
#[derive(Debug)]
pub struct TableHandle {
    id: TableId,
    backend: TableBackend,
    owner: OnceLock<NodeId>,
}

impl TableHandle {
    fn from_backend(backend: TableBackend, id: TableId) -> Arc<Self> {
        Arc::new(TableHandle {
            id,
            backend,
            owner: OnceLock::new(),
        })
    }

    /// Wraps a materialized container table.
    pub fn new_container(table: ContainerTable, repo: &TableRepository) -> Arc<Self> {
        Self::from_backend(TableBackend::Container(table), repo.next_table_id())
    }

    /// Wraps a column projection over `reference`. Fails if any index is out
    /// of range for the reference spec.
    pub fn new_projected(
        reference: Arc<TableHandle>,
        permutation: Vec<usize>,
        repo: &TableRepository,
    ) -> Result<Arc<Self>, TableError> {
        let view = ProjectedTable::new(reference, permutation)?;
        Ok(Self::from_backend(
            TableBackend::Projected(view),
            repo.next_table_id(),
        ))
    }

    /// Wraps a spec replacement over `reference`. Fails if the column counts
    /// differ.
    pub fn new_respec(
        reference: Arc<TableHandle>,
        spec: TableSpec,
        repo: &TableRepository,
    ) -> Result<Arc<Self>, TableError> {
        let view = RespecTable::new(reference, spec)?;
        Ok(Self::from_backend(
            TableBackend::Respec(view),
            repo.next_table_id(),
        ))
    }

    /// Wrapping an existing handle again is caller misuse: the handle is
    /// returned unchanged and a diagnostic is logged.
    pub fn wrap(handle: Arc<TableHandle>) -> Arc<TableHandle> {
        log::warn!(
            "no need to wrap table {} again, using the existing handle",
            handle.id
        );
        handle
    }

    /// Materializes a lazy row sequence and wraps the result.
    pub fn cache(
        spec: TableSpec,
        rows: impl IntoIterator<Item = Row>,
        monitor: &ProgressMonitor,
        repo: &TableRepository,
    ) -> Result<Arc<Self>, TableError> {
        let table = DataContainer::cache(spec, rows, monitor)?;
        Ok(Self::new_container(table, repo))
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn owner(&self) -> Option<&NodeId> {
        self.owner.get()
    }

    /// The upstream handle of a view backend, or `None` for a materialized
    /// table. Pure accessor.
    pub fn reference_table(&self) -> Option<&Arc<TableHandle>> {
        match &self.backend {
            TableBackend::Container(_) => None,
            TableBackend::Projected(view) => Some(view.reference()),
            TableBackend::Respec(view) => Some(view.reference()),
        }
    }

    pub fn backend(&self) -> &TableBackend {
        &self.backend
    }

    pub fn spec(&self) -> &TableSpec {
        match &self.backend {
            TableBackend::Container(table) => table.spec(),
            TableBackend::Projected(view) => view.spec(),
            TableBackend::Respec(view) => view.spec(),
        }
    }

    pub fn row_count(&self) -> u64 {
        match &self.backend {
            TableBackend::Container(table) => table.row_count(),
            TableBackend::Projected(view) => view.row_count(),
            TableBackend::Respec(view) => view.row_count(),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = Row> + '_> {
        match &self.backend {
            TableBackend::Container(table) => Box::new(table.iter().cloned()),
            TableBackend::Projected(view) => Box::new(view.iter()),
            TableBackend::Respec(view) => Box::new(view.iter()),
        }
    }

    /// Claims this handle and its reference chain for `owner`. The owner is
    /// set once and never overwritten; an already-owned handle ends the walk,
    /// which also terminates chains reached a second time through a shared
    /// reference.
    pub fn set_owner_recursively(&self, owner: &NodeId) {
        let mut current = self;
        while current.owner.set(owner.clone()).is_ok() {
            match current.reference_table() {
                Some(reference) => current = reference.as_ref(),
                None => break,
            }
        }
    }

    /// Saves this table under `dir` and records its meta information in
    /// `settings`.
    ///
    /// A reference with the same owner as its dependent is saved into the
    /// fixed `reference` subdirectory, its meta nested one level deeper. A
    /// reference owned elsewhere is recorded as an absence marker only —
    /// whichever node owns it persists it, so shared data is written once.
    pub fn save(
        &self,
        dir: &Path,
        settings: &mut Settings,
        monitor: &ProgressMonitor,
    ) -> Result<(), TableError> {
        // walk down the chain, collecting every handle persisted here
        let mut frames: Vec<(&TableHandle, PathBuf)> = Vec::new();
        let mut saved_ids: HashSet<TableId> = HashSet::new();
        let mut current = self;
        let mut current_dir = dir.to_path_buf();
        loop {
            saved_ids.insert(current.id);
            frames.push((current, current_dir.clone()));
            let next = match current.reference_table() {
                Some(reference)
                    if reference.owner() == current.owner()
                        && !saved_ids.contains(&reference.id()) =>
                {
                    Some(reference)
                }
                _ => None,
            };
            match next {
                Some(reference) => {
                    current_dir = current_dir.join(TABLE_SUB_DIR);
                    current = reference.as_ref();
                }
                None => break,
            }
        }

        let depth = frames.len();
        let mut metas: Vec<Settings> = Vec::with_capacity(depth);
        for (level, (handle, frame_dir)) in frames.iter().enumerate() {
            monitor.check_canceled()?;
            if level > 0 {
                fs::create_dir_all(frame_dir)?;
                if fs::metadata(frame_dir)?.permissions().readonly() {
                    return Err(TableError::Io(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("unable to write directory {}", frame_dir.display()),
                    )));
                }
            }
            let mut meta = Settings::new();
            meta.add_int(CFG_TABLE_ID, handle.id as i64);
            meta.add_string(CFG_TABLE_FILE_NAME, TABLE_FILE);
            let out = frame_dir.join(TABLE_FILE);
            // a frame descended into its reference iff a deeper frame exists
            let reference_saved_here = level + 1 < depth;
            match &handle.backend {
                TableBackend::Container(table) => {
                    table.save_archive(&out, monitor)?;
                    meta.add_string(CFG_TABLE_TYPE, TABLE_TYPE_CONTAINER);
                }
                TableBackend::Projected(view) => {
                    view.save_archive(&out)?;
                    meta.add_string(CFG_TABLE_TYPE, TABLE_TYPE_REARRANGE_COLUMN);
                    meta.add_int(CFG_REFERENCE_ID, view.reference().id() as i64);
                    meta.add_opt_string(
                        CFG_TABLE_REFERENCE,
                        reference_saved_here.then(|| TABLE_SUB_DIR.to_string()),
                    );
                }
                TableBackend::Respec(view) => {
                    view.save_archive(&out)?;
                    meta.add_string(CFG_TABLE_TYPE, TABLE_TYPE_NEW_SPEC);
                    meta.add_int(CFG_REFERENCE_ID, view.reference().id() as i64);
                    meta.add_opt_string(
                        CFG_TABLE_REFERENCE,
                        reference_saved_here.then(|| TABLE_SUB_DIR.to_string()),
                    );
                }
            }
            metas.push(meta);
        }

        // nest each reference's meta one level below its dependent's
        let mut nested: Option<Settings> = None;
        for mut meta in metas.into_iter().rev() {
            if let Some(child) = nested.take() {
                meta.add_child(CFG_TABLE_META, child);
            }
            nested = Some(meta);
        }
        if let Some(top) = nested {
            settings.add_child(CFG_TABLE_META, top);
        }
        Ok(())
    }

    /// Restores a table previously written with [`save`](Self::save),
    /// registering it (and any co-saved references) under the load session.
    /// The restored handle keeps its original id and the repository's id
    /// counter is advanced past it.
    pub fn load_from_file(
        dir: &Path,
        settings: &Settings,
        monitor: &ProgressMonitor,
        session: SessionId,
        repo: &TableRepository,
    ) -> Result<Arc<TableHandle>, TableError> {
        repo.ensure_session(session)?;

        // descend through the recorded reference subdirectories first
        let mut frames: Vec<(PathBuf, &Settings)> = Vec::new();
        let mut meta = settings.get_child(CFG_TABLE_META)?;
        let mut current_dir = dir.to_path_buf();
        loop {
            frames.push((current_dir.clone(), meta));
            let table_type = meta.get_string(CFG_TABLE_TYPE)?;
            let is_view = table_type == TABLE_TYPE_REARRANGE_COLUMN
                || table_type == TABLE_TYPE_NEW_SPEC;
            let subdir = if is_view {
                meta.get_opt_string(CFG_TABLE_REFERENCE)?
            } else {
                None
            };
            match subdir {
                Some(name) => {
                    current_dir = current_dir.join(name);
                    meta = meta.get_child(CFG_TABLE_META)?;
                }
                None => break,
            }
        }

        // restore bottom-up so every reference is registered before the view
        // that resolves it
        let mut restored = frames.iter().rev();
        let mut handle = match restored.next() {
            Some((frame_dir, frame_meta)) => {
                Self::load_single(frame_dir, frame_meta, monitor, session, repo)?
            }
            None => unreachable!("a saved table always records at least one meta frame"),
        };
        for (frame_dir, frame_meta) in restored {
            handle = Self::load_single(frame_dir, frame_meta, monitor, session, repo)?;
        }
        Ok(handle)
    }

    fn load_single(
        dir: &Path,
        meta: &Settings,
        monitor: &ProgressMonitor,
        session: SessionId,
        repo: &TableRepository,
    ) -> Result<Arc<TableHandle>, TableError> {
        let id = meta.get_int(CFG_TABLE_ID)? as TableId;
        let file_name = meta.get_string(CFG_TABLE_FILE_NAME)?;
        let src = dir.join(file_name);
        // backend deserialization may consume or lock its input, so it runs
        // against a scratch copy of the persisted archive
        let scratch = tempfile::NamedTempFile::new()?;
        copy_file_with_progress(&src, scratch.path(), monitor)?;

        let table_type = meta.get_string(CFG_TABLE_TYPE)?;
        let backend = match table_type {
            TABLE_TYPE_CONTAINER => {
                TableBackend::Container(ContainerTable::read_archive(scratch.path())?)
            }
            TABLE_TYPE_REARRANGE_COLUMN => {
                let reference = Self::resolve_reference(meta, session, repo)?;
                TableBackend::Projected(ProjectedTable::read_archive(scratch.path(), reference)?)
            }
            TABLE_TYPE_NEW_SPEC => {
                let reference = Self::resolve_reference(meta, session, repo)?;
                TableBackend::Respec(RespecTable::read_archive(scratch.path(), reference)?)
            }
            other => return Err(TableError::UnknownTableType(other.to_string())),
        };

        let handle = Self::from_backend(backend, id);
        repo.advance_table_id(id);
        repo.put(session, handle.clone())?;
        Ok(handle)
    }

    fn resolve_reference(
        meta: &Settings,
        session: SessionId,
        repo: &TableRepository,
    ) -> Result<Arc<TableHandle>, TableError> {
        let reference_id = meta.get_int(CFG_REFERENCE_ID)? as TableId;
        Ok(repo.get(session, reference_id)?)
    }
}

// Cancellation stays a distinct condition even when it surfaces from inside
// a container operation.
impl From<ContainerError> for TableError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::Canceled(c) => TableError::Canceled(c),
            other => TableError::Container(other),
        }
    }
}

fn write_view_blob<T: Serialize>(path: &Path, value: &T) -> Result<(), TableError> {
    let file = File::create(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    bincode::serialize_into(&mut encoder, value)?;
    encoder.finish()?.flush()?;
    Ok(())
}

fn read_view_blob<T: DeserializeOwned>(path: &Path) -> Result<T, TableError> {
    let file = File::open(path)?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    Ok(bincode::deserialize_from(&mut decoder)?)
}
