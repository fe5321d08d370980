//! The global file list produced by enumeration, and its on-disk cache format.
//!
//! The list is stored as the per-worker partitions the enumerator produced; a global index
//! addresses entries across partitions in rank order. The cache is JSON lines, one entry per
//! line, and entry order carries no meaning.

use std::os::unix::fs::MetadataExt;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::instrument;

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl EntryType {
    pub fn from_file_type(file_type: &std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            EntryType::Symlink
        } else if file_type.is_dir() {
            EntryType::Directory
        } else if file_type.is_file() {
            EntryType::Regular
        } else {
            EntryType::Other
        }
    }
}

/// One filesystem object discovered by enumeration.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileListEntry {
    pub path: std::path::PathBuf,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    #[serde(default)]
    pub mtime_nsec: i64,
    #[serde(default)]
    pub atime: i64,
    #[serde(default)]
    pub atime_nsec: i64,
    /// Index of the source this entry was enumerated under; assigned again on replay.
    #[serde(skip)]
    pub source: usize,
}

impl FileListEntry {
    pub fn from_metadata(
        path: std::path::PathBuf,
        source: usize,
        metadata: &std::fs::Metadata,
    ) -> Self {
        Self {
            path,
            entry_type: EntryType::from_file_type(&metadata.file_type()),
            size: metadata.size(),
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            mtime: metadata.mtime(),
            mtime_nsec: metadata.mtime_nsec(),
            atime: metadata.atime(),
            atime_nsec: metadata.atime_nsec(),
            source,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.entry_type == EntryType::Regular
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileListError {
    #[error("cannot read file list {path:?}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write file list {path:?}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed entry in file list {path:?} at line {line}")]
    Parse {
        path: std::path::PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, Default)]
pub struct FileList {
    partitions: Vec<Vec<FileListEntry>>,
}

impl FileList {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_partitions(partitions: Vec<Vec<FileListEntry>>) -> Self {
        Self { partitions }
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition(&self, rank: usize) -> &[FileListEntry] {
        self.partitions.get(rank).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Entry at a global index, counting through partitions in rank order.
    pub fn get(&self, mut index: usize) -> Option<&FileListEntry> {
        for partition in &self.partitions {
            if index < partition.len() {
                return partition.get(index);
            }
            index -= partition.len();
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileListEntry> {
        self.partitions.iter().flatten()
    }
}

/// Loads every entry of a cached file list.
#[instrument]
pub async fn read_cache(path: &std::path::Path) -> Result<Vec<FileListEntry>, FileListError> {
    let read_error = |source| FileListError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = tokio::fs::File::open(path).await.map_err(read_error)?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut entries = Vec::new();
    let mut line_number = 0;
    while let Some(line) = lines.next_line().await.map_err(read_error)? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str::<FileListEntry>(&line).map_err(|source| {
            FileListError::Parse {
                path: path.to_path_buf(),
                line: line_number,
                source,
            }
        })?;
        entries.push(entry);
    }
    tracing::info!("read {} entries from {:?}", entries.len(), path);
    Ok(entries)
}

/// Writes the whole list, one JSON object per line.
#[instrument(skip(flist))]
pub async fn write_cache(path: &std::path::Path, flist: &FileList) -> Result<(), FileListError> {
    let write_error = |source| FileListError::Write {
        path: path.to_path_buf(),
        source,
    };
    let file = tokio::fs::File::create(path).await.map_err(write_error)?;
    let mut writer = tokio::io::BufWriter::new(file);
    for (index, entry) in flist.iter().enumerate() {
        let mut line = serde_json::to_vec(entry).map_err(|source| FileListError::Parse {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;
        line.push(b'\n');
        writer.write_all(&line).await.map_err(write_error)?;
    }
    writer.flush().await.map_err(write_error)?;
    tracing::info!("wrote {} entries to {:?}", flist.len(), path);
    Ok(())
}
