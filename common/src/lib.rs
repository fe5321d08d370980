//! Core of `dcp`, a parallel copy tool for large directory trees.
//!
//! A copy job runs in three stages:
//!
//! 1. [`classify`] decides how the sources map onto the destination and rejects impossible
//!    combinations before anything touches the filesystem.
//! 2. [`walk`] enumerates the sources (or replays a cached list through the [`skip`] filter)
//!    into a [`flist::FileList`].
//! 3. [`work`] turns the list into phases of work items which [`job`] runs on the
//!    work-stealing [`scheduler`], each item executed by a [`copy::CopyExecutor`].
//!
//! [`run`] sets up logging, the tokio runtime and the progress display around a job.

use std::sync::Arc;

pub mod classify;
pub mod config;
pub mod copy;
pub mod flist;
pub mod job;
pub mod path;
pub mod preserve;
pub mod progress;
pub mod scheduler;
pub mod skip;
pub mod walk;
pub mod work;

#[cfg(test)]
mod testutils;

pub use config::{JobConfig, LogLevel, OutputConfig, ProgressSettings, RuntimeConfig};
pub use copy::Summary;
pub use job::dcp;

const DEFAULT_PROGRESS_DELAY: std::time::Duration = std::time::Duration::from_millis(200);

fn init_tracing(output: &OutputConfig) {
    use tracing_subscriber::filter::LevelFilter;
    let filter = match output.level() {
        None => tracing_subscriber::EnvFilter::new("off"),
        Some(level) => tracing_subscriber::EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(level).into())
            .from_env_lossy(),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

struct ProgressTracker {
    stop: std::sync::mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

impl ProgressTracker {
    fn start(prog_track: Arc<progress::Progress>, delay: std::time::Duration) -> Self {
        let (stop, stopped) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let bar = indicatif::ProgressBar::new_spinner();
            let mut printer = progress::ProgressPrinter::new(&prog_track);
            loop {
                bar.set_message(printer.print());
                bar.tick();
                match stopped.recv_timeout(delay) {
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
            bar.finish_and_clear();
        });
        Self { stop, handle }
    }

    fn finish(self) {
        // the thread also stops if the receiver sees a disconnect
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            tracing::warn!("progress display thread panicked");
        }
    }
}

/// Runs `func` on a freshly built runtime with logging and (optionally) a progress display.
///
/// Returns `None` if the job failed or could not be started; the error has been logged by then.
pub fn run<Fut, Summary, Error>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce(Arc<progress::Progress>) -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to start the runtime: {}", &error);
            return None;
        }
    };
    let delay = match progress.as_ref().and_then(|p| p.progress_delay.as_deref()) {
        Some(delay) => match humantime::parse_duration(delay) {
            Ok(delay) => delay,
            Err(error) => {
                tracing::error!("invalid progress delay {:?}: {}", delay, &error);
                return None;
            }
        },
        None => DEFAULT_PROGRESS_DELAY,
    };
    let prog_track = Arc::new(progress::Progress::new());
    let tracker = progress
        .is_some()
        .then(|| ProgressTracker::start(prog_track.clone(), delay));
    let res = runtime.block_on(func(prog_track.clone()));
    if let Some(tracker) = tracker {
        tracker.finish();
    }
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose {
                println!("{summary}");
                println!("walltime: {:.2?}", prog_track.get_duration());
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{}", &error);
            None
        }
    }
}
