//! Replicates mode bits, ownership and timestamps recorded at enumeration onto a destination.

use std::os::unix::prelude::PermissionsExt;

use tracing::{event, instrument, Level};

use crate::flist::{EntryType, FileListEntry};

/// Failures to change ownership or mode for lack of privilege are logged and tolerated.
fn is_privilege_error(error: &std::io::Error) -> bool {
    matches!(
        error.raw_os_error().map(nix::errno::Errno::from_raw),
        Some(nix::errno::Errno::EPERM)
    )
}

#[instrument(skip(entry))]
pub async fn set_metadata(entry: &FileListEntry, dst: &std::path::Path) -> std::io::Result<()> {
    let entry = entry.clone();
    let dst = dst.to_owned();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        // owner first: chown may clear setuid/setgid bits that the mode below restores
        event!(Level::DEBUG, "setting uid and gid");
        if let Err(errno) = nix::unistd::fchownat(
            nix::fcntl::AT_FDCWD,
            &dst,
            Some(nix::unistd::Uid::from_raw(entry.uid)),
            Some(nix::unistd::Gid::from_raw(entry.gid)),
            nix::fcntl::AtFlags::AT_SYMLINK_NOFOLLOW,
        ) {
            if errno != nix::errno::Errno::EPERM {
                return Err(errno.into());
            }
            tracing::warn!(
                "cannot set {:?} owner to {} and group to {}: {}",
                &dst,
                entry.uid,
                entry.gid,
                errno
            );
        }
        // symlinks carry no mode of their own
        if entry.entry_type != EntryType::Symlink {
            let permissions = std::fs::Permissions::from_mode(entry.mode & 0o7777);
            event!(Level::DEBUG, "setting permissions {:?}", &permissions);
            if let Err(error) = std::fs::set_permissions(&dst, permissions) {
                if !is_privilege_error(&error) {
                    return Err(error);
                }
                tracing::warn!("cannot set {:?} mode to {:o}: {}", &dst, entry.mode, &error);
            }
        }
        // timestamps last so that nothing above bumps them again
        event!(Level::DEBUG, "setting timestamps");
        let atime = filetime::FileTime::from_unix_time(entry.atime, entry.atime_nsec as u32);
        let mtime = filetime::FileTime::from_unix_time(entry.mtime, entry.mtime_nsec as u32);
        filetime::set_symlink_file_times(&dst, atime, mtime)
    })
    .await
    .map_err(std::io::Error::other)?
}
