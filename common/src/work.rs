//! Work items and the plan that turns a file list into ordered copy phases.
//!
//! Each phase is run to global termination before the next one starts, which is what orders
//! parents before children and file creation before any chunk of that file is written.

use crate::classify::DestinationMap;
use crate::flist::{EntryType, FileListEntry};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    CreateDirectory,
    /// Create or truncate the destination file; `size` is the final length
    CreateFile { size: u64 },
    CreateSymlink,
    /// Copy `length` bytes starting at `offset` into an already created file
    CopyRange { offset: u64, length: u64 },
    /// Replicate mode, ownership and timestamps recorded at enumeration
    SetMetadata { entry: Box<FileListEntry> },
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Action::CreateDirectory => write!(f, "create directory"),
            Action::CreateFile { size } => write!(f, "create file ({size} bytes)"),
            Action::CreateSymlink => write!(f, "create symlink"),
            Action::CopyRange { offset, length } => {
                write!(f, "copy bytes [{offset}, {})", offset + length)
            }
            Action::SetMetadata { .. } => write!(f, "set metadata"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub src: std::path::PathBuf,
    pub dst: std::path::PathBuf,
    pub action: Action,
    pub status: ItemStatus,
}

impl WorkItem {
    pub fn new(src: std::path::PathBuf, dst: std::path::PathBuf, action: Action) -> Self {
        Self {
            src,
            dst,
            action,
            status: ItemStatus::Pending,
        }
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {:?} -> {:?}", self.action, self.src, self.dst)
    }
}

/// Splits a regular file of `size` bytes into copy ranges of at most `chunk_size` bytes.
/// Empty files need no range at all; a zero chunk size means "one range for the whole file".
pub fn split_ranges(size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    if size == 0 {
        return vec![];
    }
    if chunk_size == 0 {
        return vec![(0, size)];
    }
    let mut ranges = Vec::with_capacity(size.div_ceil(chunk_size) as usize);
    let mut offset = 0;
    while offset < size {
        let length = chunk_size.min(size - offset);
        ranges.push((offset, length));
        offset += length;
    }
    ranges
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhaseKind {
    CreateBase,
    Directories { depth: usize },
    Create,
    Copy,
    FileMetadata,
    DirectoryMetadata { depth: usize },
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PhaseKind::CreateBase => write!(f, "destination base"),
            PhaseKind::Directories { depth } => write!(f, "directories at depth {depth}"),
            PhaseKind::Create => write!(f, "files and symlinks"),
            PhaseKind::Copy => write!(f, "file contents"),
            PhaseKind::FileMetadata => write!(f, "file metadata"),
            PhaseKind::DirectoryMetadata { depth } => {
                write!(f, "directory metadata at depth {depth}")
            }
        }
    }
}

#[derive(Debug)]
pub struct Phase {
    pub kind: PhaseKind,
    pub items: Vec<WorkItem>,
}

#[derive(Debug, Default)]
pub struct Plan {
    pub base: Option<WorkItem>,
    pub directories: std::collections::BTreeMap<usize, Vec<WorkItem>>,
    pub create: Vec<WorkItem>,
    pub copy: Vec<WorkItem>,
    pub file_metadata: Vec<WorkItem>,
    pub directory_metadata: std::collections::BTreeMap<usize, Vec<WorkItem>>,
    /// Entries that produce no work (special files, entries outside every source)
    pub skipped: u64,
}

#[derive(Copy, Clone, Debug)]
pub struct PlanSettings {
    pub chunk_size: u64,
    pub preserve: bool,
    /// Create the destination directory before anything else
    pub create_base: bool,
}

impl Plan {
    pub fn build<'a>(
        entries: impl IntoIterator<Item = &'a FileListEntry>,
        map: &DestinationMap,
        settings: &PlanSettings,
    ) -> Self {
        let mut plan = Plan::default();
        if settings.create_base {
            let base = map.dest().to_path_buf();
            plan.base = Some(WorkItem::new(base.clone(), base, Action::CreateDirectory));
        }
        for entry in entries {
            let Some(dst) = map.destination_for_entry(entry) else {
                tracing::warn!("{:?} is not under any source, skipping", &entry.path);
                plan.skipped += 1;
                continue;
            };
            let depth = dst.components().count();
            let src = entry.path.clone();
            match entry.entry_type {
                EntryType::Directory => {
                    plan.directories.entry(depth).or_default().push(WorkItem::new(
                        src.clone(),
                        dst.clone(),
                        Action::CreateDirectory,
                    ));
                    if settings.preserve {
                        plan.directory_metadata
                            .entry(depth)
                            .or_default()
                            .push(metadata_item(entry, src, dst));
                    }
                }
                EntryType::Regular => {
                    plan.create.push(WorkItem::new(
                        src.clone(),
                        dst.clone(),
                        Action::CreateFile { size: entry.size },
                    ));
                    for (offset, length) in split_ranges(entry.size, settings.chunk_size) {
                        plan.copy.push(WorkItem::new(
                            src.clone(),
                            dst.clone(),
                            Action::CopyRange { offset, length },
                        ));
                    }
                    if settings.preserve {
                        plan.file_metadata.push(metadata_item(entry, src, dst));
                    }
                }
                EntryType::Symlink => {
                    plan.create.push(WorkItem::new(
                        src.clone(),
                        dst.clone(),
                        Action::CreateSymlink,
                    ));
                    if settings.preserve {
                        plan.file_metadata.push(metadata_item(entry, src, dst));
                    }
                }
                EntryType::Other => {
                    tracing::warn!("{:?} is not a file, directory or symlink, skipping", &src);
                    plan.skipped += 1;
                }
            }
        }
        plan
    }

    pub fn len(&self) -> usize {
        usize::from(self.base.is_some())
            + self.directories.values().map(Vec::len).sum::<usize>()
            + self.create.len()
            + self.copy.len()
            + self.file_metadata.len()
            + self.directory_metadata.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes the plan into phases in execution order: the base, directories shallowest
    /// first, files and symlinks, contents, file metadata, then directory metadata deepest
    /// first. Empty phases are left out.
    pub fn into_phases(self) -> Vec<Phase> {
        let mut phases = Vec::new();
        if let Some(base) = self.base {
            phases.push(Phase {
                kind: PhaseKind::CreateBase,
                items: vec![base],
            });
        }
        for (depth, items) in self.directories {
            phases.push(Phase {
                kind: PhaseKind::Directories { depth },
                items,
            });
        }
        phases.push(Phase {
            kind: PhaseKind::Create,
            items: self.create,
        });
        phases.push(Phase {
            kind: PhaseKind::Copy,
            items: self.copy,
        });
        phases.push(Phase {
            kind: PhaseKind::FileMetadata,
            items: self.file_metadata,
        });
        for (depth, items) in self.directory_metadata.into_iter().rev() {
            phases.push(Phase {
                kind: PhaseKind::DirectoryMetadata { depth },
                items,
            });
        }
        phases.retain(|phase| !phase.items.is_empty());
        phases
    }
}

fn metadata_item(
    entry: &FileListEntry,
    src: std::path::PathBuf,
    dst: std::path::PathBuf,
) -> WorkItem {
    WorkItem::new(
        src,
        dst,
        Action::SetMetadata {
            entry: Box::new(entry.clone()),
        },
    )
}
