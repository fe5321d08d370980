//! Decides how the sources map onto the destination before any enumeration or I/O starts.
//!
//! Valid combinations:
//!
//! | destination         | sources                         | topology                |
//! |---------------------|---------------------------------|-------------------------|
//! | existing directory  | anything                        | `DirectoryFanout`       |
//! | existing file       | exactly one regular file        | `SingleFileOverwrite`   |
//! | missing, recursive  | exactly one regular file        | `SingleFileOverwrite`   |
//! | missing, recursive  | anything else                   | `DirectoryFanout`       |
//! | missing, flat       | exactly one regular file        | `SingleFileOverwrite`   |
//!
//! Everything else (a directory onto a file, several sources onto one file, a directory into
//! itself, a source whose destination would be the source itself, no readable sources) is
//! `Invalid` and aborts the job.

use crate::flist::FileListEntry;
use crate::path::{self, ParamPath, PathKind};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DestinationTopology {
    SingleFileOverwrite,
    DirectoryFanout,
    Invalid { reason: String },
}

impl DestinationTopology {
    pub fn is_valid(&self) -> bool {
        !matches!(self, DestinationTopology::Invalid { .. })
    }
}

impl std::fmt::Display for DestinationTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DestinationTopology::SingleFileOverwrite => write!(f, "single-file-overwrite"),
            DestinationTopology::DirectoryFanout => write!(f, "directory-fanout"),
            DestinationTopology::Invalid { reason } => write!(f, "invalid: {reason}"),
        }
    }
}

fn invalid(reason: String) -> DestinationTopology {
    DestinationTopology::Invalid { reason }
}

/// Classifies the copy. Missing sources are ignored here; callers warn about them.
pub fn classify(
    sources: &[ParamPath],
    dest: &ParamPath,
    recursive: bool,
) -> DestinationTopology {
    let existing: Vec<&ParamPath> = sources.iter().filter(|src| src.exists()).collect();
    if existing.is_empty() {
        return invalid("no readable source paths were given".to_string());
    }
    let single_file = existing.len() == 1 && existing[0].is_file();
    let topology = match dest.kind() {
        PathKind::Directory => DestinationTopology::DirectoryFanout,
        PathKind::File | PathKind::Other => {
            if single_file {
                DestinationTopology::SingleFileOverwrite
            } else if let Some(dir) = existing.iter().find(|src| src.is_dir()) {
                return invalid(format!(
                    "cannot overwrite non-directory {:?} with directory {:?}",
                    dest.path(),
                    dir.path()
                ));
            } else {
                return invalid(format!(
                    "cannot copy {} sources onto the single file {:?}",
                    existing.len(),
                    dest.path()
                ));
            }
        }
        PathKind::Missing => {
            if single_file {
                DestinationTopology::SingleFileOverwrite
            } else if recursive {
                DestinationTopology::DirectoryFanout
            } else if let Some(dir) = existing.iter().find(|src| src.is_dir()) {
                return invalid(format!(
                    "cannot copy directory {:?} without recursion",
                    dir.path()
                ));
            } else {
                return invalid(format!(
                    "cannot copy {} sources onto the single file {:?}",
                    existing.len(),
                    dest.path()
                ));
            }
        }
    };
    match topology {
        DestinationTopology::SingleFileOverwrite => {
            if let Some(src) = existing.iter().find(|src| src.path() == dest.path()) {
                return invalid(format!("cannot copy {:?} onto itself", src.path()));
            }
        }
        DestinationTopology::DirectoryFanout => {
            if let Some(dir) = existing
                .iter()
                .find(|src| src.is_dir() && path::is_same_or_descendant(dest.path(), src.path()))
            {
                return invalid(format!(
                    "cannot copy directory {:?} into itself ({:?})",
                    dir.path(),
                    dest.path()
                ));
            }
            // the destination of a source placed into its own parent is the source itself
            if let Some(src) = existing.iter().find(|src| src.rebase_prefix() == dest.path()) {
                return invalid(format!(
                    "cannot copy {:?} onto itself, {:?} is already its parent directory",
                    src.path(),
                    dest.path()
                ));
            }
        }
        DestinationTopology::Invalid { .. } => {}
    }
    topology
}

/// Computes destination paths for enumerated entries under a valid topology.
#[derive(Clone, Debug)]
pub struct DestinationMap {
    topology: DestinationTopology,
    prefixes: Vec<std::path::PathBuf>,
    dest: std::path::PathBuf,
}

impl DestinationMap {
    /// Fails with the classifier's reason when the topology is invalid.
    pub fn new(
        topology: &DestinationTopology,
        sources: &[ParamPath],
        dest: &ParamPath,
    ) -> anyhow::Result<Self> {
        if let DestinationTopology::Invalid { reason } = topology {
            return Err(anyhow::anyhow!("{}", reason));
        }
        Ok(Self {
            topology: topology.clone(),
            prefixes: sources
                .iter()
                .map(|src| src.rebase_prefix().to_path_buf())
                .collect(),
            dest: dest.path().to_path_buf(),
        })
    }

    pub fn topology(&self) -> &DestinationTopology {
        &self.topology
    }

    pub fn dest(&self) -> &std::path::Path {
        &self.dest
    }

    /// Destination of an object enumerated under source number `source`.
    pub fn destination_for(
        &self,
        src: &std::path::Path,
        source: usize,
    ) -> Option<std::path::PathBuf> {
        match self.topology {
            DestinationTopology::SingleFileOverwrite => Some(self.dest.clone()),
            DestinationTopology::DirectoryFanout => {
                let prefix = self.prefixes.get(source)?;
                path::rebase(src, prefix, &self.dest)
            }
            DestinationTopology::Invalid { .. } => None,
        }
    }

    pub fn destination_for_entry(&self, entry: &FileListEntry) -> Option<std::path::PathBuf> {
        self.destination_for(&entry.path, entry.source)
    }
}
