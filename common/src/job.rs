//! Runs a whole copy job: classify, enumerate, plan and execute the copy phases.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::instrument;

use crate::classify::{self, DestinationMap, DestinationTopology};
use crate::config::JobConfig;
use crate::copy::{CopyError, CopyExecutor, Error, Summary};
use crate::flist;
use crate::progress::Progress;
use crate::scheduler::{self, Handler, Outcome};
use crate::skip;
use crate::walk;
use crate::work::{ItemStatus, Plan, PlanSettings, WorkItem};

struct CopyHandler {
    config: Arc<JobConfig>,
    prog_track: Arc<Progress>,
}

pub struct CopyState {
    executor: CopyExecutor,
    pub summary: Summary,
    /// Items that failed on this worker (status `Failed`) with their errors
    pub failed: Vec<(WorkItem, CopyError)>,
}

impl Handler<WorkItem> for CopyHandler {
    type State = CopyState;

    fn init_state(&self, _rank: usize) -> CopyState {
        CopyState {
            executor: CopyExecutor::new(self.config.clone(), self.prog_track.clone()),
            summary: Summary::default(),
            failed: Vec::new(),
        }
    }

    async fn handle(
        &self,
        _rank: usize,
        mut item: WorkItem,
        state: &mut CopyState,
        _spawned: &mut Vec<WorkItem>,
    ) -> Outcome {
        let _ops_guard = self.prog_track.items.guard();
        item.status = ItemStatus::InProgress;
        match state.executor.execute(&item).await {
            Ok(summary) => {
                item.status = ItemStatus::Done;
                state.summary = state.summary
                    + summary
                    + Summary {
                        items_completed: 1,
                        ..Default::default()
                    };
                Outcome::Done
            }
            Err(error) => {
                tracing::error!("{} failed: {}: {}", &item, &error, &error.source);
                item.status = ItemStatus::Failed;
                self.prog_track.items_failed.inc();
                state.summary.items_failed += 1;
                state.failed.push((item, error));
                Outcome::Failed
            }
        }
    }
}

/// Copies the configured sources to the destination.
///
/// Invalid source/destination combinations fail before anything is read or written. Failed
/// work items do not stop the job; they are reported together at the end.
#[instrument(skip_all)]
pub async fn dcp(config: Arc<JobConfig>, prog_track: Arc<Progress>) -> Result<Summary, Error> {
    config
        .validate()
        .map_err(|reason| Error::new(anyhow!(reason), Default::default()))?;
    let topology = classify::classify(&config.sources, &config.dest, config.recursive);
    tracing::info!("destination topology: {}", &topology);
    let map = DestinationMap::new(&topology, &config.sources, &config.dest)
        .map_err(|err| Error::new(err, Default::default()))?;
    for (first, later) in skip::overlapping_sources(&config.sources) {
        tracing::warn!(
            "sources {:?} and {:?} overlap, their common entries are copied only once as part of {:?}",
            config.sources[first].path(),
            config.sources[later].path(),
            config.sources[first].path()
        );
    }
    let enumeration = match &config.input {
        Some(input) => {
            let entries = flist::read_cache(input)
                .await
                .map_err(|err| Error::new(err.into(), Default::default()))?;
            walk::replay(&config, &prog_track, entries).await
        }
        None => walk::walk(&config, &prog_track).await,
    }
    .context("enumeration failed")
    .map_err(|err| Error::new(err, Default::default()))?;
    let mut summary = enumeration.summary;
    if let Some(output) = &config.output {
        flist::write_cache(output, &enumeration.flist)
            .await
            .map_err(|err| Error::new(err.into(), summary))?;
    }
    let plan = Plan::build(
        enumeration.flist.iter(),
        &map,
        &PlanSettings {
            chunk_size: config.chunk_size,
            preserve: config.preserve,
            create_base: topology == DestinationTopology::DirectoryFanout
                && !config.dest.exists(),
        },
    );
    drop(enumeration);
    summary.entries_skipped += plan.skipped as usize;
    prog_track.entries_skipped.add(plan.skipped);
    let total_items = plan.len();
    tracing::info!("planned {} work items", total_items);
    let handler = Arc::new(CopyHandler {
        config: config.clone(),
        prog_track: prog_track.clone(),
    });
    let settings = config.scheduler_settings();
    let mut failed = Vec::new();
    for phase in plan.into_phases() {
        let kind = phase.kind;
        tracing::debug!("phase '{}': {} items", kind, phase.items.len());
        let report = scheduler::run(&settings, handler.clone(), phase.items)
            .await
            .with_context(|| format!("copying {kind} aborted"))
            .map_err(|err| Error::new(err, summary))?;
        let totals = report.totals();
        tracing::debug!(
            "phase '{}' done: {} completed, {} failed, {} stolen",
            kind,
            totals.completed,
            totals.failed,
            totals.stolen
        );
        for state in report.into_states() {
            summary = summary + state.summary;
            failed.extend(state.failed);
        }
    }
    if let Some((item, error)) = failed.first() {
        return Err(Error::new(
            anyhow!(
                "{} of {} work items failed, the first was: {}: {}",
                failed.len(),
                total_items,
                item,
                error
            ),
            summary,
        ));
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ParamPath;
    use crate::testutils;
    use tracing_test::traced_test;

    async fn config_for(
        sources: &[&std::path::Path],
        dest: &std::path::Path,
    ) -> anyhow::Result<JobConfig> {
        let mut params = Vec::new();
        for src in sources {
            params.push(ParamPath::resolve(src.to_str().unwrap()).await?);
        }
        let dest = ParamPath::resolve(dest.to_str().unwrap()).await?;
        Ok(JobConfig::new(params, dest))
    }

    async fn run(config: JobConfig) -> Result<Summary, Error> {
        dcp(Arc::new(config), Arc::new(Progress::new())).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[traced_test]
    async fn tree_copies_identically_for_any_worker_count() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.path().join("foo");
        let big: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();
        tokio::fs::write(foo.join("bar").join("big.bin"), &big).await?;
        for workers in [1, 4] {
            let dst = tmp_dir.path().join(format!("out{workers}"));
            tokio::fs::create_dir(&dst).await?;
            let mut config = config_for(&[&foo], &dst).await?;
            config.workers = workers;
            config.chunk_size = 16 * 1024;
            let summary = run(config).await?;
            testutils::check_dirs_identical(&foo, &dst.join("foo"))?;
            assert_eq!(summary.items_failed, 0);
            assert_eq!(summary.files_created, 6);
            assert_eq!(summary.symlinks_created, 2);
            assert_eq!(summary.directories_created, 3);
            assert_eq!(summary.bytes_copied, 200_005);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_run_changes_nothing() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        tokio::fs::create_dir(&dst).await?;
        let mut config = config_for(&[&foo], &dst).await?;
        config.workers = 3;
        config.preserve = true;
        run(config.clone()).await?;
        let summary = run(config).await?;
        testutils::check_dirs_identical(&foo, &dst.join("foo"))?;
        assert_eq!(summary.items_failed, 0);
        assert_eq!(summary.directories_created, 0);
        assert_eq!(summary.directories_unchanged, 3);
        assert_eq!(summary.symlinks_unchanged, 2);
        Ok(())
    }

    #[tokio::test]
    async fn missing_destination_becomes_a_directory() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("new");
        let mut config = config_for(&[&foo.join("bar"), &foo.join("0.txt")], &dst).await?;
        config.workers = 2;
        run(config).await?;
        testutils::check_dirs_identical(&foo.join("bar"), &dst.join("bar"))?;
        assert_eq!(tokio::fs::read_to_string(dst.join("0.txt")).await?, "0");
        Ok(())
    }

    #[tokio::test]
    async fn single_file_overwrites_destination() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo").join("0.txt");
        let dst = tmp_dir.path().join("target.txt");
        tokio::fs::write(&dst, "a much longer old content").await?;
        let summary = run(config_for(&[&src], &dst).await?).await?;
        assert_eq!(tokio::fs::read_to_string(&dst).await?, "0");
        assert_eq!(summary.files_created, 1);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_topology_does_no_work() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("file");
        tokio::fs::write(&dst, "keep").await?;
        let config = config_for(&[&foo.join("bar"), &foo.join("baz")], &dst).await?;
        let error = run(config).await.unwrap_err();
        assert!(format!("{error}").contains("non-directory"), "{error}");
        assert_eq!(error.summary, Summary::default());
        assert_eq!(tokio::fs::read_to_string(&dst).await?, "keep");
        Ok(())
    }

    #[tokio::test]
    async fn copy_into_own_parent_leaves_source_intact() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.path().join("foo");
        let error = run(config_for(&[&foo.join("0.txt")], &foo).await?)
            .await
            .unwrap_err();
        assert!(format!("{error}").contains("onto itself"), "{error}");
        assert_eq!(tokio::fs::read_to_string(foo.join("0.txt")).await?, "0");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn overlapping_sources_are_reported() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        tokio::fs::create_dir(&dst).await?;
        let summary = run(config_for(&[&foo.join("bar"), &foo], &dst).await?).await?;
        assert_eq!(summary.items_failed, 0);
        assert!(logs_contain("overlap"));
        testutils::check_dirs_identical(&foo.join("bar"), &dst.join("bar"))?;
        assert_eq!(tokio::fs::read_to_string(dst.join("foo").join("0.txt")).await?, "0");
        assert!(!dst.join("foo").join("bar").exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_items_fail_the_job_but_not_the_rest() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        tokio::fs::create_dir_all(dst.join("foo")).await?;
        // a file where the "bar" directory must go
        tokio::fs::write(dst.join("foo").join("bar"), "in the way").await?;
        let mut config = config_for(&[&foo], &dst).await?;
        config.workers = 2;
        let error = run(config).await.unwrap_err();
        // bar itself, then creating and filling each of its three files
        assert_eq!(error.summary.items_failed, 7);
        assert!(format!("{error}").contains("work items failed"), "{error}");
        assert_eq!(
            tokio::fs::read_to_string(dst.join("foo").join("baz").join("4.txt")).await?,
            "4"
        );
        assert!(logs_contain("not a directory"));
        Ok(())
    }

    #[tokio::test]
    async fn preserve_keeps_modes_and_times() -> anyhow::Result<()> {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.path().join("foo");
        tokio::fs::set_permissions(foo.join("0.txt"), std::fs::Permissions::from_mode(0o640))
            .await?;
        tokio::fs::set_permissions(foo.join("bar"), std::fs::Permissions::from_mode(0o750))
            .await?;
        let old = filetime::FileTime::from_unix_time(1_234_567_890, 0);
        filetime::set_file_mtime(foo.join("bar"), old)?;
        filetime::set_file_mtime(foo.join("0.txt"), old)?;
        let dst = tmp_dir.path().join("dst");
        tokio::fs::create_dir(&dst).await?;
        let mut config = config_for(&[&foo], &dst).await?;
        config.preserve = true;
        run(config).await?;
        let file_md = tokio::fs::metadata(dst.join("foo").join("0.txt")).await?;
        assert_eq!(file_md.mode() & 0o7777, 0o640);
        assert_eq!(file_md.mtime(), 1_234_567_890);
        let dir_md = tokio::fs::metadata(dst.join("foo").join("bar")).await?;
        assert_eq!(dir_md.mode() & 0o7777, 0o750);
        // directory times are set after its children were written
        assert_eq!(dir_md.mtime(), 1_234_567_890);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn list_written_then_replayed() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.path().join("foo");
        let cache = tmp_dir.path().join("list.jsonl");
        let first = tmp_dir.path().join("first");
        tokio::fs::create_dir(&first).await?;
        let mut config = config_for(&[&foo], &first).await?;
        config.output = Some(cache.clone());
        run(config).await?;
        assert_eq!(flist::read_cache(&cache).await?.len(), 10);
        // replay only the bar subtree
        let second = tmp_dir.path().join("second");
        tokio::fs::create_dir(&second).await?;
        let mut config = config_for(&[&foo.join("bar")], &second).await?;
        config.input = Some(cache);
        let summary = run(config).await?;
        testutils::check_dirs_identical(&foo.join("bar"), &second.join("bar"))?;
        assert!(!second.join("0.txt").exists());
        assert!(!second.join("foo").exists());
        assert_eq!(summary.entries_skipped, 6);
        Ok(())
    }
}
