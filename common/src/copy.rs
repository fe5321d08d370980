//! Executes single work items: directory, file and symlink creation, byte-range copies and
//! metadata replication.

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

use crate::config::JobConfig;
use crate::preserve;
use crate::progress;
use crate::work::{Action, WorkItem};

/// Block size used to look for holes when copying sparsely
pub const SPARSE_BLOCK: usize = 4096;

/// Error type for whole copy jobs that preserves the summary even on failure.
///
/// # Logging Convention
/// The Display implementation shows the full error chain, so it can be logged with any format
/// specifier.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CopyErrorKind {
    NameTooLong,
    NoSpace,
    PermissionDenied,
    ShortRead,
    NotADirectory,
    Io,
}

impl CopyErrorKind {
    pub fn classify(error: &std::io::Error) -> Self {
        use nix::errno::Errno;
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            return CopyErrorKind::ShortRead;
        }
        match error.raw_os_error().map(Errno::from_raw) {
            Some(Errno::ENAMETOOLONG) => CopyErrorKind::NameTooLong,
            Some(Errno::ENOSPC) | Some(Errno::EDQUOT) => CopyErrorKind::NoSpace,
            Some(Errno::EACCES) | Some(Errno::EPERM) => CopyErrorKind::PermissionDenied,
            Some(Errno::ENOTDIR) => CopyErrorKind::NotADirectory,
            _ => CopyErrorKind::Io,
        }
    }
}

impl std::fmt::Display for CopyErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CopyErrorKind::NameTooLong => write!(f, "path too long"),
            CopyErrorKind::NoSpace => write!(f, "disk full"),
            CopyErrorKind::PermissionDenied => write!(f, "permission denied"),
            CopyErrorKind::ShortRead => write!(f, "short read"),
            CopyErrorKind::NotADirectory => write!(f, "not a directory"),
            CopyErrorKind::Io => write!(f, "I/O error"),
        }
    }
}

/// Failure of a single work item; carries the path and the underlying cause.
#[derive(Debug, thiserror::Error)]
#[error("cannot {op} {path:?}: {kind}")]
pub struct CopyError {
    pub op: &'static str,
    pub kind: CopyErrorKind,
    pub path: std::path::PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl CopyError {
    pub fn new(op: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self {
            op,
            kind: CopyErrorKind::classify(&source),
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub entries_walked: usize,
    pub entries_skipped: usize,
    pub items_completed: usize,
    pub items_failed: usize,
    pub bytes_copied: u64,
    pub files_created: usize,
    pub symlinks_created: usize,
    pub directories_created: usize,
    pub symlinks_unchanged: usize,
    pub directories_unchanged: usize,
    pub metadata_set: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            entries_walked: self.entries_walked + other.entries_walked,
            entries_skipped: self.entries_skipped + other.entries_skipped,
            items_completed: self.items_completed + other.items_completed,
            items_failed: self.items_failed + other.items_failed,
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_created: self.files_created + other.files_created,
            symlinks_created: self.symlinks_created + other.symlinks_created,
            directories_created: self.directories_created + other.directories_created,
            symlinks_unchanged: self.symlinks_unchanged + other.symlinks_unchanged,
            directories_unchanged: self.directories_unchanged + other.directories_unchanged,
            metadata_set: self.metadata_set + other.metadata_set,
        }
    }
}

impl std::iter::Sum for Summary {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Summary::default(), |acc, summary| acc + summary)
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "entries walked: {}\n\
            entries skipped: {}\n\
            items completed: {}\n\
            items failed: {}\n\
            bytes copied: {}\n\
            files created: {}\n\
            symlinks created: {}\n\
            directories created: {}\n\
            symlinks unchanged: {}\n\
            directories unchanged: {}\n\
            metadata set: {}",
            self.entries_walked,
            self.entries_skipped,
            self.items_completed,
            self.items_failed,
            bytesize::ByteSize(self.bytes_copied),
            self.files_created,
            self.symlinks_created,
            self.directories_created,
            self.symlinks_unchanged,
            self.directories_unchanged,
            self.metadata_set,
        )
    }
}

#[cfg(target_os = "linux")]
fn drop_page_cache(file: &tokio::fs::File, offset: u64, len: u64) {
    if let Err(errno) = nix::fcntl::posix_fadvise(
        file,
        offset as libc::off_t,
        len as libc::off_t,
        nix::fcntl::PosixFadviseAdvice::POSIX_FADV_DONTNEED,
    ) {
        tracing::debug!("posix_fadvise failed: {}", errno);
    }
}

#[cfg(not(target_os = "linux"))]
fn drop_page_cache(_file: &tokio::fs::File, _offset: u64, _len: u64) {}

/// Runs work items for one worker. Owns the worker's copy buffer.
pub struct CopyExecutor {
    config: std::sync::Arc<JobConfig>,
    prog_track: std::sync::Arc<progress::Progress>,
    buffer: Vec<u8>,
}

impl CopyExecutor {
    pub fn new(
        config: std::sync::Arc<JobConfig>,
        prog_track: std::sync::Arc<progress::Progress>,
    ) -> Self {
        Self {
            config,
            prog_track,
            buffer: Vec::new(),
        }
    }

    #[instrument(skip(self, item), fields(src = ?item.src, dst = ?item.dst))]
    pub async fn execute(&mut self, item: &WorkItem) -> Result<Summary, CopyError> {
        tracing::debug!("{}", &item.action);
        let summary = match &item.action {
            Action::CreateDirectory => self.create_directory(&item.dst).await?,
            Action::CreateFile { size } => self.create_file(&item.src, &item.dst, *size).await?,
            Action::CreateSymlink => self.create_symlink(&item.src, &item.dst).await?,
            Action::CopyRange { offset, length } => {
                self.copy_range(&item.src, &item.dst, *offset, *length)
                    .await?
            }
            Action::SetMetadata { entry } => {
                preserve::set_metadata(entry, &item.dst)
                    .await
                    .map_err(|err| CopyError::new("set metadata on", &item.dst, err))?;
                self.prog_track.metadata_set.inc();
                Summary {
                    metadata_set: 1,
                    ..Default::default()
                }
            }
        };
        Ok(summary)
    }

    async fn create_directory(&self, dst: &std::path::Path) -> Result<Summary, CopyError> {
        match tokio::fs::create_dir(dst).await {
            Ok(()) => {
                self.prog_track.directories_created.inc();
                Ok(Summary {
                    directories_created: 1,
                    ..Default::default()
                })
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                let dst_metadata = tokio::fs::symlink_metadata(dst)
                    .await
                    .map_err(|err| CopyError::new("read metadata of", dst, err))?;
                if !dst_metadata.is_dir() {
                    return Err(CopyError::new(
                        "create directory",
                        dst,
                        std::io::Error::from_raw_os_error(libc::ENOTDIR),
                    ));
                }
                tracing::debug!("directory already exists");
                self.prog_track.directories_unchanged.inc();
                Ok(Summary {
                    directories_unchanged: 1,
                    ..Default::default()
                })
            }
            Err(error) => Err(CopyError::new("create directory", dst, error)),
        }
    }

    async fn create_file(
        &self,
        src: &std::path::Path,
        dst: &std::path::Path,
        size: u64,
    ) -> Result<Summary, CopyError> {
        use std::os::unix::fs::MetadataExt;
        match tokio::fs::symlink_metadata(dst).await {
            Ok(dst_metadata) if dst_metadata.is_symlink() => {
                // never write through a link into whatever it points at
                tracing::info!("'dst' is a symlink, replacing it with a file");
                tokio::fs::remove_file(dst)
                    .await
                    .map_err(|err| CopyError::new("remove", dst, err))?;
            }
            Ok(dst_metadata) => {
                // hard links and bind mounts can alias the source under another name
                let same_file = matches!(
                    tokio::fs::symlink_metadata(src).await,
                    Ok(src_metadata) if src_metadata.dev() == dst_metadata.dev()
                        && src_metadata.ino() == dst_metadata.ino()
                );
                if same_file {
                    return Err(CopyError::new(
                        "create file",
                        dst,
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            format!("destination is the same file as {src:?}"),
                        ),
                    ));
                }
            }
            Err(_) => {}
        }
        let open = || {
            let mut options = tokio::fs::OpenOptions::new();
            options
                .write(true)
                .create(true)
                .truncate(true)
                .custom_flags(libc::O_NOFOLLOW);
            async move { options.open(dst).await }
        };
        let file = match open().await {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied => {
                // a read-only file left by an earlier run is replaced
                match tokio::fs::symlink_metadata(dst).await {
                    Ok(md) if md.is_file() => {
                        tracing::info!("destination is not writable, replacing it");
                        tokio::fs::remove_file(dst)
                            .await
                            .map_err(|err| CopyError::new("remove", dst, err))?;
                        open()
                            .await
                            .map_err(|err| CopyError::new("create file", dst, err))?
                    }
                    _ => return Err(CopyError::new("create file", dst, error)),
                }
            }
            Err(error) => return Err(CopyError::new("create file", dst, error)),
        };
        // sized up front so that chunks (and holes) may land in any order
        file.set_len(size)
            .await
            .map_err(|err| CopyError::new("set length of", dst, err))?;
        self.prog_track.files_created.inc();
        Ok(Summary {
            files_created: 1,
            ..Default::default()
        })
    }

    async fn create_symlink(
        &self,
        src: &std::path::Path,
        dst: &std::path::Path,
    ) -> Result<Summary, CopyError> {
        let link = tokio::fs::read_link(src)
            .await
            .map_err(|err| CopyError::new("read symlink", src, err))?;
        match tokio::fs::symlink(&link, dst).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                let dst_metadata = tokio::fs::symlink_metadata(dst)
                    .await
                    .map_err(|err| CopyError::new("read metadata of", dst, err))?;
                if dst_metadata.is_symlink() {
                    let dst_link = tokio::fs::read_link(dst)
                        .await
                        .map_err(|err| CopyError::new("read symlink", dst, err))?;
                    if dst_link == link {
                        tracing::debug!("symlink already exists, skipping");
                        self.prog_track.symlinks_unchanged.inc();
                        return Ok(Summary {
                            symlinks_unchanged: 1,
                            ..Default::default()
                        });
                    }
                    tracing::debug!("'dst' is a symlink but points to a different path, updating");
                } else if dst_metadata.is_dir() {
                    return Err(CopyError::new("replace directory with symlink", dst, error));
                } else {
                    tracing::info!("'dst' is not a symlink, updating");
                }
                tokio::fs::remove_file(dst)
                    .await
                    .map_err(|err| CopyError::new("remove", dst, err))?;
                tokio::fs::symlink(&link, dst)
                    .await
                    .map_err(|err| CopyError::new("create symlink", dst, err))?;
            }
            Err(error) => return Err(CopyError::new("create symlink", dst, error)),
        }
        self.prog_track.symlinks_created.inc();
        Ok(Summary {
            symlinks_created: 1,
            ..Default::default()
        })
    }

    async fn copy_range(
        &mut self,
        src: &std::path::Path,
        dst: &std::path::Path,
        offset: u64,
        length: u64,
    ) -> Result<Summary, CopyError> {
        let mut reader = tokio::fs::File::open(src)
            .await
            .map_err(|err| CopyError::new("open for reading", src, err))?;
        let mut options = tokio::fs::OpenOptions::new();
        let mut flags = libc::O_NOFOLLOW;
        if self.config.synchronous {
            flags |= libc::O_DSYNC;
        }
        options.write(true).custom_flags(flags);
        let mut writer = options
            .open(dst)
            .await
            .map_err(|err| CopyError::new("open for writing", dst, err))?;
        reader
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|err| CopyError::new("seek in", src, err))?;
        let buffer_size = self.config.chunk_size.min(length).max(1) as usize;
        if self.buffer.len() < buffer_size {
            self.buffer.resize(buffer_size, 0);
        }
        let mut position = offset;
        let end = offset + length;
        while position < end {
            let len = ((end - position) as usize).min(buffer_size);
            let buf = &mut self.buffer[..len];
            reader
                .read_exact(buf)
                .await
                .map_err(|err| CopyError::new("read", src, err))?;
            if self.config.sparse {
                write_sparse(&mut writer, buf, position)
                    .await
                    .map_err(|err| CopyError::new("write", dst, err))?;
            } else {
                writer
                    .seek(std::io::SeekFrom::Start(position))
                    .await
                    .map_err(|err| CopyError::new("seek in", dst, err))?;
                writer
                    .write_all(buf)
                    .await
                    .map_err(|err| CopyError::new("write", dst, err))?;
            }
            if self.config.synchronous {
                writer
                    .flush()
                    .await
                    .map_err(|err| CopyError::new("write", dst, err))?;
                drop_page_cache(&reader, position, len as u64);
                drop_page_cache(&writer, position, len as u64);
            }
            position += len as u64;
        }
        writer
            .flush()
            .await
            .map_err(|err| CopyError::new("write", dst, err))?;
        self.prog_track.bytes_copied.add(length);
        Ok(Summary {
            bytes_copied: length,
            ..Default::default()
        })
    }
}

/// Writes `buf` at `position`, seeking over every all-zero block instead of writing it.
async fn write_sparse(
    writer: &mut tokio::fs::File,
    buf: &[u8],
    position: u64,
) -> std::io::Result<()> {
    let mut data_start: Option<usize> = None;
    let mut offset = 0;
    while offset < buf.len() {
        let block_end = (offset + SPARSE_BLOCK).min(buf.len());
        let is_zero = buf[offset..block_end].iter().all(|byte| *byte == 0);
        match (is_zero, data_start) {
            (false, None) => data_start = Some(offset),
            (true, Some(start)) => {
                write_at(writer, &buf[start..offset], position + start as u64).await?;
                data_start = None;
            }
            _ => {}
        }
        offset = block_end;
    }
    if let Some(start) = data_start {
        write_at(writer, &buf[start..], position + start as u64).await?;
    }
    Ok(())
}

async fn write_at(writer: &mut tokio::fs::File, data: &[u8], position: u64) -> std::io::Result<()> {
    writer.seek(std::io::SeekFrom::Start(position)).await?;
    writer.write_all(data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flist::FileListEntry;
    use crate::path::{ParamPath, PathKind};
    use std::os::unix::fs::MetadataExt;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn executor(tmp: &std::path::Path, configure: impl FnOnce(&mut JobConfig)) -> CopyExecutor {
        let mut config = JobConfig::new(
            vec![ParamPath::new("src", tmp.join("src"), PathKind::Directory)],
            ParamPath::new("dst", tmp.join("dst"), PathKind::Missing),
        );
        configure(&mut config);
        CopyExecutor::new(Arc::new(config), Arc::new(progress::Progress::new()))
    }

    fn item(src: &std::path::Path, dst: &std::path::Path, action: Action) -> WorkItem {
        WorkItem::new(src.to_owned(), dst.to_owned(), action)
    }

    /// Creates the destination file and copies every range of it.
    async fn copy_whole(
        executor: &mut CopyExecutor,
        src: &std::path::Path,
        dst: &std::path::Path,
    ) -> Result<Summary, CopyError> {
        let size = std::fs::metadata(src).map_err(|e| CopyError::new("stat", src, e))?.len();
        let mut summary = executor
            .execute(&item(src, dst, Action::CreateFile { size }))
            .await?;
        let chunk = executor.config.chunk_size;
        for (offset, length) in crate::work::split_ranges(size, chunk) {
            summary = summary
                + executor
                    .execute(&item(src, dst, Action::CopyRange { offset, length }))
                    .await?;
        }
        Ok(summary)
    }

    #[tokio::test]
    #[traced_test]
    async fn chunked_copy_matches_source() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("f");
        let dst = tmp.path().join("g");
        let data: Vec<u8> = (0..100_003u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&src, &data).await?;
        let mut executor = executor(tmp.path(), |config| config.chunk_size = 4096);
        let summary = copy_whole(&mut executor, &src, &dst).await?;
        assert_eq!(summary.files_created, 1);
        assert_eq!(summary.bytes_copied, 100_003);
        assert_eq!(tokio::fs::read(&dst).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn chunks_can_arrive_out_of_order() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("f");
        let dst = tmp.path().join("g");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8 + 1).collect();
        tokio::fs::write(&src, &data).await?;
        let mut executor = executor(tmp.path(), |config| config.chunk_size = 3000);
        executor
            .execute(&item(&src, &dst, Action::CreateFile { size: 10_000 }))
            .await?;
        let mut ranges = crate::work::split_ranges(10_000, 3000);
        ranges.reverse();
        for (offset, length) in ranges {
            executor
                .execute(&item(&src, &dst, Action::CopyRange { offset, length }))
                .await?;
        }
        assert_eq!(tokio::fs::read(&dst).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn empty_file_is_created() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("empty");
        let dst = tmp.path().join("copy");
        tokio::fs::write(&src, "").await?;
        tokio::fs::write(&dst, "stale contents").await?;
        let mut executor = executor(tmp.path(), |_| {});
        let summary = copy_whole(&mut executor, &src, &dst).await?;
        assert_eq!(summary.bytes_copied, 0);
        assert_eq!(tokio::fs::metadata(&dst).await?.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn sparse_copy_leaves_holes() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("zeros");
        let mut data = vec![0u8; 1024 * 1024];
        data.extend_from_slice(b"0123456789");
        tokio::fs::write(&src, &data).await?;
        let dense = tmp.path().join("dense");
        let sparse = tmp.path().join("sparse");
        let mut plain = executor(tmp.path(), |_| {});
        copy_whole(&mut plain, &src, &dense).await?;
        let mut holey = executor(tmp.path(), |config| config.sparse = true);
        copy_whole(&mut holey, &src, &sparse).await?;
        assert_eq!(tokio::fs::read(&sparse).await?, data);
        let dense_md = tokio::fs::metadata(&dense).await?;
        let sparse_md = tokio::fs::metadata(&sparse).await?;
        assert_eq!(sparse_md.len(), dense_md.len());
        assert!(
            sparse_md.blocks() < dense_md.blocks(),
            "sparse: {} blocks, dense: {} blocks",
            sparse_md.blocks(),
            dense_md.blocks()
        );
        Ok(())
    }

    #[tokio::test]
    async fn synchronous_copy_matches_source() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("f");
        let dst = tmp.path().join("g");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 13) as u8).collect();
        tokio::fs::write(&src, &data).await?;
        let mut executor = executor(tmp.path(), |config| {
            config.synchronous = true;
            config.chunk_size = 8192;
        });
        copy_whole(&mut executor, &src, &dst).await?;
        assert_eq!(tokio::fs::read(&dst).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn truncated_source_is_a_short_read() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("f");
        let dst = tmp.path().join("g");
        tokio::fs::write(&src, vec![1u8; 100]).await?;
        let mut executor = executor(tmp.path(), |_| {});
        executor
            .execute(&item(&src, &dst, Action::CreateFile { size: 200 }))
            .await?;
        let error = executor
            .execute(&item(
                &src,
                &dst,
                Action::CopyRange {
                    offset: 0,
                    length: 200,
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(error.kind, CopyErrorKind::ShortRead);
        assert_eq!(error.path, src);
        Ok(())
    }

    #[tokio::test]
    async fn directory_creation_is_idempotent() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("d");
        let mut executor = executor(tmp.path(), |_| {});
        let first = executor
            .execute(&item(&dir, &dir, Action::CreateDirectory))
            .await?;
        let second = executor
            .execute(&item(&dir, &dir, Action::CreateDirectory))
            .await?;
        assert_eq!(first.directories_created, 1);
        assert_eq!(second.directories_unchanged, 1);
        let file = tmp.path().join("f");
        tokio::fs::write(&file, "x").await?;
        let error = executor
            .execute(&item(&file, &file, Action::CreateDirectory))
            .await
            .unwrap_err();
        assert_eq!(error.kind, CopyErrorKind::NotADirectory);
        Ok(())
    }

    #[tokio::test]
    async fn symlinks_are_recreated_or_left_alone() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("link");
        let dst = tmp.path().join("copy");
        tokio::fs::symlink("../somewhere", &src).await?;
        let mut executor = executor(tmp.path(), |_| {});
        let created = executor
            .execute(&item(&src, &dst, Action::CreateSymlink))
            .await?;
        assert_eq!(created.symlinks_created, 1);
        assert_eq!(
            tokio::fs::read_link(&dst).await?,
            std::path::PathBuf::from("../somewhere")
        );
        let again = executor
            .execute(&item(&src, &dst, Action::CreateSymlink))
            .await?;
        assert_eq!(again.symlinks_unchanged, 1);
        tokio::fs::remove_file(&dst).await?;
        tokio::fs::symlink("elsewhere", &dst).await?;
        let replaced = executor
            .execute(&item(&src, &dst, Action::CreateSymlink))
            .await?;
        assert_eq!(replaced.symlinks_created, 1);
        assert_eq!(
            tokio::fs::read_link(&dst).await?,
            std::path::PathBuf::from("../somewhere")
        );
        Ok(())
    }

    #[tokio::test]
    async fn read_only_destination_is_replaced() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("f");
        let dst = tmp.path().join("g");
        tokio::fs::write(&src, "new").await?;
        tokio::fs::write(&dst, "old contents").await?;
        tokio::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o444)).await?;
        let mut executor = executor(tmp.path(), |_| {});
        copy_whole(&mut executor, &src, &dst).await?;
        assert_eq!(tokio::fs::read_to_string(&dst).await?, "new");
        Ok(())
    }

    #[tokio::test]
    async fn symlinked_destination_is_replaced_not_followed() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("f");
        let dst = tmp.path().join("g");
        let victim = tmp.path().join("victim");
        tokio::fs::write(&src, "new").await?;
        tokio::fs::write(&victim, "keep me").await?;
        tokio::fs::symlink(&victim, &dst).await?;
        let mut executor = executor(tmp.path(), |_| {});
        copy_whole(&mut executor, &src, &dst).await?;
        assert_eq!(tokio::fs::read_to_string(&victim).await?, "keep me");
        assert!(tokio::fs::symlink_metadata(&dst).await?.is_file());
        assert_eq!(tokio::fs::read_to_string(&dst).await?, "new");
        Ok(())
    }

    #[tokio::test]
    async fn range_copy_does_not_follow_symlinks() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("f");
        let dst = tmp.path().join("g");
        let victim = tmp.path().join("victim");
        tokio::fs::write(&src, "new").await?;
        tokio::fs::write(&victim, "keep me").await?;
        tokio::fs::symlink(&victim, &dst).await?;
        let mut executor = executor(tmp.path(), |_| {});
        let error = executor
            .execute(&item(&src, &dst, Action::CopyRange { offset: 0, length: 3 }))
            .await
            .unwrap_err();
        assert_eq!(error.source.raw_os_error(), Some(libc::ELOOP));
        assert_eq!(tokio::fs::read_to_string(&victim).await?, "keep me");
        Ok(())
    }

    #[tokio::test]
    async fn hard_linked_destination_keeps_source_intact() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("f");
        let dst = tmp.path().join("g");
        tokio::fs::write(&src, "precious data").await?;
        tokio::fs::hard_link(&src, &dst).await?;
        let mut executor = executor(tmp.path(), |_| {});
        let error = executor
            .execute(&item(&src, &dst, Action::CreateFile { size: 13 }))
            .await
            .unwrap_err();
        assert!(error.source.to_string().contains("same file"), "{error}");
        assert_eq!(tokio::fs::read_to_string(&src).await?, "precious data");
        Ok(())
    }

    #[tokio::test]
    async fn missing_parent_fails_with_path() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dst = tmp.path().join("no").join("such").join("file");
        let mut executor = executor(tmp.path(), |_| {});
        let error = executor
            .execute(&item(&dst, &dst, Action::CreateFile { size: 1 }))
            .await
            .unwrap_err();
        assert_eq!(error.path, dst);
        assert_eq!(error.kind, CopyErrorKind::Io);
        Ok(())
    }

    #[tokio::test]
    async fn metadata_items_are_counted() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("f");
        let dst = tmp.path().join("g");
        tokio::fs::write(&src, "x").await?;
        tokio::fs::write(&dst, "x").await?;
        let entry = FileListEntry::from_metadata(src.clone(), 0, &std::fs::metadata(&src)?);
        let mut executor = executor(tmp.path(), |_| {});
        let summary = executor
            .execute(&item(
                &src,
                &dst,
                Action::SetMetadata {
                    entry: Box::new(entry),
                },
            ))
            .await?;
        assert_eq!(summary.metadata_set, 1);
        assert_eq!(executor.prog_track.metadata_set.get(), 1);
        Ok(())
    }

    #[test]
    fn errors_are_classified() {
        let kind = |errno| CopyErrorKind::classify(&std::io::Error::from_raw_os_error(errno));
        assert_eq!(kind(libc::ENAMETOOLONG), CopyErrorKind::NameTooLong);
        assert_eq!(kind(libc::ENOSPC), CopyErrorKind::NoSpace);
        assert_eq!(kind(libc::EACCES), CopyErrorKind::PermissionDenied);
        assert_eq!(kind(libc::EPERM), CopyErrorKind::PermissionDenied);
        assert_eq!(kind(libc::EIO), CopyErrorKind::Io);
        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(CopyErrorKind::classify(&eof), CopyErrorKind::ShortRead);
    }
}
