//! User-supplied path parameters and the path-string primitives used to rebase and filter them.
//!
//! Paths are made absolute and lexically normalized (`.` and `..` removed, repeated separators
//! collapsed) without resolving symlinks, so a source that is itself a symlink is copied as a
//! symlink.

use tracing::instrument;

/// What a [`ParamPath`] refers to at the time it was resolved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
    /// Exists but is neither a regular file nor a directory (fifo, socket, device)
    Other,
    Missing,
}

/// A source or destination argument, resolved once at startup and immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamPath {
    orig: String,
    path: std::path::PathBuf,
    kind: PathKind,
}

impl ParamPath {
    /// Builds a parameter without touching the filesystem. `path` must already be absolute.
    pub fn new(orig: &str, path: impl Into<std::path::PathBuf>, kind: PathKind) -> Self {
        let path = path.into();
        debug_assert!(path.is_absolute(), "{path:?} is not absolute");
        Self {
            orig: orig.to_string(),
            path: normalize(&path),
            kind,
        }
    }

    /// Resolves a command-line argument: makes it absolute against the current directory,
    /// normalizes it and stats it (following symlinks) to learn its kind.
    #[instrument]
    pub async fn resolve(orig: &str) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let path = absolute(std::path::Path::new(orig), &cwd);
        let kind = match tokio::fs::metadata(&path).await {
            Ok(md) if md.is_dir() => PathKind::Directory,
            Ok(md) if md.is_file() => PathKind::File,
            Ok(_) => PathKind::Other,
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("cannot stat {:?}: {}", &path, &error);
                }
                PathKind::Missing
            }
        };
        Ok(Self {
            orig: orig.to_string(),
            path,
            kind,
        })
    }

    pub fn orig(&self) -> &str {
        &self.orig
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn kind(&self) -> PathKind {
        self.kind
    }

    pub fn exists(&self) -> bool {
        self.kind != PathKind::Missing
    }

    pub fn is_file(&self) -> bool {
        self.kind == PathKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == PathKind::Directory
    }

    /// The prefix stripped from everything enumerated under this source when rebasing it under a
    /// destination directory: the source's parent, or `/` for the root itself.
    pub fn rebase_prefix(&self) -> &std::path::Path {
        self.path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("/"))
    }
}

/// Lexically normalizes an absolute path. `..` at the root stays at the root.
pub fn normalize(path: &std::path::Path) -> std::path::PathBuf {
    use std::path::Component;
    let mut out = std::path::PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    if out.as_os_str().is_empty() {
        out.push("/");
    }
    out
}

/// Makes `path` absolute against `cwd` and normalizes it.
pub fn absolute(path: &std::path::Path, cwd: &std::path::Path) -> std::path::PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&cwd.join(path))
    }
}

/// True if `path` equals `ancestor` or lies underneath it.
///
/// Compares whole components, so `/data/foobar` is not contained in `/data/foo`.
pub fn is_same_or_descendant(path: &std::path::Path, ancestor: &std::path::Path) -> bool {
    path.starts_with(ancestor)
}

/// Re-roots `path` from `prefix` onto `base`; `None` if `path` is not under `prefix`.
pub fn rebase(
    path: &std::path::Path,
    prefix: &std::path::Path,
    base: &std::path::Path,
) -> Option<std::path::PathBuf> {
    let suffix = path.strip_prefix(prefix).ok()?;
    if suffix.as_os_str().is_empty() {
        return Some(base.to_path_buf());
    }
    Some(base.join(suffix))
}
