//! Parallel enumeration of the sources into the global file list.
//!
//! Walk tasks run on the work-stealing scheduler: visiting a directory pushes one task per child,
//! so a large subtree discovered by one worker is quickly spread to idle ones. Errors are logged
//! and the affected object (or subtree) is skipped.

use std::sync::Arc;

use tracing::instrument;

use crate::config::JobConfig;
use crate::copy::Summary;
use crate::flist::{FileList, FileListEntry};
use crate::progress::Progress;
use crate::scheduler::{self, Handler, Outcome, SchedulerError};
use crate::skip;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkTask {
    pub path: std::path::PathBuf,
    /// Index of the source this path belongs to
    pub source: usize,
    /// List directory contents and push a task per child
    pub recurse: bool,
}

#[derive(Debug, Default)]
pub struct WalkState {
    pub entries: Vec<FileListEntry>,
    pub walked: usize,
    pub skipped: usize,
}

struct Walker {
    config: Arc<JobConfig>,
    prog_track: Arc<Progress>,
}

impl Walker {
    fn skip(&self, state: &mut WalkState) {
        state.skipped += 1;
        self.prog_track.entries_skipped.inc();
    }
}

impl Handler<WalkTask> for Walker {
    type State = WalkState;

    fn init_state(&self, _rank: usize) -> WalkState {
        WalkState::default()
    }

    async fn handle(
        &self,
        rank: usize,
        task: WalkTask,
        state: &mut WalkState,
        spawned: &mut Vec<WalkTask>,
    ) -> Outcome {
        // overlapping sources: a path is enumerated only under the first source containing it
        let owner = skip::matching_source(&task.path, &self.config.sources);
        if owner != Some(task.source) {
            tracing::debug!(
                "{:?} is enumerated under source {:?}, not {}",
                &task.path,
                owner,
                task.source
            );
            return Outcome::Done;
        }
        let metadata = match tokio::fs::symlink_metadata(&task.path).await {
            Ok(metadata) => metadata,
            Err(error) => {
                tracing::warn!("cannot stat {:?}, skipping: {}", &task.path, &error);
                self.skip(state);
                return Outcome::Failed;
            }
        };
        tracing::trace!("worker {} visited {:?}", rank, &task.path);
        let entry = FileListEntry::from_metadata(task.path.clone(), task.source, &metadata);
        let descend = task.recurse && entry.is_dir();
        state.entries.push(entry);
        state.walked += 1;
        self.prog_track.entries_walked.inc();
        if !descend {
            return Outcome::Done;
        }
        let mut dir = match tokio::fs::read_dir(&task.path).await {
            Ok(dir) => dir,
            Err(error) => {
                tracing::warn!(
                    "cannot read directory {:?}, skipping its contents: {}",
                    &task.path,
                    &error
                );
                self.skip(state);
                return Outcome::Done;
            }
        };
        loop {
            match dir.next_entry().await {
                Ok(Some(child)) => spawned.push(WalkTask {
                    path: child.path(),
                    source: task.source,
                    recurse: true,
                }),
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(
                        "failed listing {:?}, skipping the rest of it: {}",
                        &task.path,
                        &error
                    );
                    self.skip(state);
                    break;
                }
            }
        }
        Outcome::Done
    }
}

/// A finished enumeration: the file list plus the walk counters.
#[derive(Debug)]
pub struct Enumeration {
    pub flist: FileList,
    pub summary: Summary,
}

async fn enumerate(
    config: &Arc<JobConfig>,
    prog_track: &Arc<Progress>,
    seeds: Vec<WalkTask>,
    skipped: usize,
) -> Result<Enumeration, SchedulerError> {
    let walker = Arc::new(Walker {
        config: config.clone(),
        prog_track: prog_track.clone(),
    });
    let report = scheduler::run(&config.scheduler_settings(), walker, seeds).await?;
    let totals = report.totals();
    tracing::debug!("enumeration scheduler totals: {:?}", &totals);
    let mut summary = Summary {
        entries_skipped: skipped,
        ..Default::default()
    };
    let mut partitions = Vec::with_capacity(report.workers.len());
    for state in report.into_states() {
        summary.entries_walked += state.walked;
        summary.entries_skipped += state.skipped;
        partitions.push(state.entries);
    }
    let flist = FileList::from_partitions(partitions);
    tracing::info!(
        "enumerated {} entries ({} skipped)",
        flist.len(),
        summary.entries_skipped
    );
    Ok(Enumeration { flist, summary })
}

/// Walks every existing source live.
#[instrument(skip_all)]
pub async fn walk(
    config: &Arc<JobConfig>,
    prog_track: &Arc<Progress>,
) -> Result<Enumeration, SchedulerError> {
    let mut skipped = 0;
    let mut seeds = Vec::with_capacity(config.sources.len());
    for (source, src) in config.sources.iter().enumerate() {
        if !src.exists() {
            tracing::warn!("source {:?} does not exist, skipping", src.orig());
            skipped += 1;
            prog_track.entries_skipped.inc();
            continue;
        }
        seeds.push(WalkTask {
            path: src.path().to_path_buf(),
            source,
            recurse: config.recursive,
        });
    }
    enumerate(config, prog_track, seeds, skipped).await
}

/// Rebuilds the file list from cached entries: keeps those under a requested source (the first
/// such source owns the entry) and stats each of them again. Entries that vanished since the
/// list was written are logged and skipped.
#[instrument(skip_all)]
pub async fn replay(
    config: &Arc<JobConfig>,
    prog_track: &Arc<Progress>,
    entries: Vec<FileListEntry>,
) -> Result<Enumeration, SchedulerError> {
    let mut skipped = 0;
    let mut seen = std::collections::HashSet::with_capacity(entries.len());
    let mut seeds = Vec::with_capacity(entries.len());
    for entry in entries {
        if !entry.path.is_absolute() {
            tracing::warn!("cached path {:?} is not absolute, skipping", &entry.path);
            skipped += 1;
            continue;
        }
        let path = crate::path::normalize(&entry.path);
        if !skip::should_copy(&path, &config.sources) {
            skipped += 1;
            continue;
        }
        let Some(source) = skip::matching_source(&path, &config.sources) else {
            continue;
        };
        if !seen.insert(path.clone()) {
            tracing::debug!("{:?} is listed more than once", &path);
            continue;
        }
        seeds.push(WalkTask {
            path,
            source,
            recurse: false,
        });
    }
    prog_track.entries_skipped.add(skipped as u64);
    enumerate(config, prog_track, seeds, skipped).await
}
