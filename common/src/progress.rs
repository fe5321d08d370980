use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{event, instrument, Level};

#[derive(Debug)]
pub struct TlsCounter {
    // each thread bumps its own slot, readers sum all of them
    count: thread_local::ThreadLocal<AtomicU64>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        self.count
            .get_or(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count
            .iter()
            .fold(0, |x, y| x + y.load(Ordering::Relaxed))
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts work items entering and leaving execution.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Live counters shared by every worker of a job.
#[derive(Debug)]
pub struct Progress {
    pub items: ProgressCounter,
    pub items_failed: TlsCounter,
    pub entries_walked: TlsCounter,
    pub entries_skipped: TlsCounter,
    pub bytes_copied: TlsCounter,
    pub files_created: TlsCounter,
    pub symlinks_created: TlsCounter,
    pub directories_created: TlsCounter,
    pub symlinks_unchanged: TlsCounter,
    pub directories_unchanged: TlsCounter,
    pub metadata_set: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            items: Default::default(),
            items_failed: Default::default(),
            entries_walked: Default::default(),
            entries_skipped: Default::default(),
            bytes_copied: Default::default(),
            files_created: Default::default(),
            symlinks_created: Default::default(),
            directories_created: Default::default(),
            symlinks_unchanged: Default::default(),
            directories_unchanged: Default::default(),
            metadata_set: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_items: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_items: progress.items.get().finished,
            last_bytes: progress.bytes_copied.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let items = self.progress.items.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64().max(f64::EPSILON);
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64().max(f64::EPSILON);
        let average_items_rate = items.finished as f64 / total_duration_secs;
        let current_items_rate =
            items.finished.saturating_sub(self.last_items) as f64 / curr_duration_secs;
        let bytes = self.progress.bytes_copied.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = bytes.saturating_sub(self.last_bytes) as f64 / curr_duration_secs;
        self.last_items = items.finished;
        self.last_bytes = bytes;
        self.last_update = time_now;
        format!(
            "---------------------\n\
            WALK:\n\
            entries:     {:>10}\n\
            skipped:     {:>10}\n\
            -----------------------\n\
            ITEMS:\n\
            pending: {:>10}\n\
            failed:  {:>10}\n\
            average: {:>10.2} items/s\n\
            current: {:>10.2} items/s\n\
            -----------------------\n\
            COPIED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            \n\
            files:       {:>10}\n\
            symlinks:    {:>10}\n\
            directories: {:>10}\n\
            metadata:    {:>10}\n\
            -----------------------\n\
            UNCHANGED:\n\
            symlinks:    {:>10}\n\
            directories: {:>10}",
            self.progress.entries_walked.get(),
            self.progress.entries_skipped.get(),
            items.started - items.finished,
            self.progress.items_failed.get(),
            average_items_rate,
            current_items_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            self.progress.files_created.get(),
            self.progress.symlinks_created.get(),
            self.progress.directories_created.get(),
            self.progress.metadata_set.get(),
            self.progress.symlinks_unchanged.get(),
            self.progress.directories_unchanged.get(),
        )
    }
}
