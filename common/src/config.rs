//! Configuration types for the copy job, the runtime and the output

use crate::path::ParamPath;
use crate::scheduler::VictimSelection;

/// Default size of a copy range and of the copy buffer
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Everything a copy job needs, built once from the command line and shared read-only by all
/// workers.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub sources: Vec<ParamPath>,
    pub dest: ParamPath,
    /// Replicate mode bits, ownership and timestamps
    pub preserve: bool,
    /// Write through to storage and drop copied ranges from the page cache
    pub synchronous: bool,
    /// Leave holes where the source has runs of zero blocks
    pub sparse: bool,
    /// Descend into source directories
    pub recursive: bool,
    pub chunk_size: u64,
    /// Number of scheduler workers (0 = number of CPU cores)
    pub workers: usize,
    pub victim: VictimSelection,
    /// Replay this cached file list instead of walking the sources
    pub input: Option<std::path::PathBuf>,
    /// Store the enumerated file list here
    pub output: Option<std::path::PathBuf>,
}

impl JobConfig {
    pub fn new(sources: Vec<ParamPath>, dest: ParamPath) -> Self {
        Self {
            sources,
            dest,
            preserve: false,
            synchronous: false,
            sparse: false,
            recursive: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 0,
            victim: VictimSelection::default(),
            input: None,
            output: None,
        }
    }

    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk size must be greater than zero".to_string());
        }
        if self.sources.is_empty() {
            return Err("at least one source path is required".to_string());
        }
        Ok(())
    }

    /// Worker count with 0 resolved to the number of CPU cores.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn scheduler_settings(&self) -> crate::scheduler::Settings {
        crate::scheduler::Settings {
            victim: self.victim,
            ..crate::scheduler::Settings::new(self.worker_count())
        }
    }
}

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Log levels accepted by `-d/--debug`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    #[value(alias = "error")]
    Fatal,
    Err,
    #[value(alias = "warning")]
    Warn,
    #[default]
    Info,
    #[value(alias = "debug")]
    Dbg,
}

impl LogLevel {
    pub fn to_level(self) -> tracing::Level {
        match self {
            LogLevel::Fatal | LogLevel::Err => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Dbg => tracing::Level::DEBUG,
        }
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Log everything (TRACE), overrides `log_level`
    pub verbose: bool,
    pub log_level: LogLevel,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// `None` turns logging off entirely.
    pub fn level(&self) -> Option<tracing::Level> {
        if self.quiet {
            None
        } else if self.verbose {
            Some(tracing::Level::TRACE)
        } else {
            Some(self.log_level.to_level())
        }
    }
}

/// Progress display configuration
#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    /// Human readable delay between updates, e.g. "200ms" or "1s"
    pub progress_delay: Option<String>,
}
