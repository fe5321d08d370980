use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dcp",
    version,
    about = "Copy large filesets in parallel using work-stealing workers",
    long_about = "`dcp` copies files, directories and symlinks using a pool of workers that balance the load by stealing work from each other.

Large files are split into chunks that are copied independently, so a single big file keeps every worker busy.

EXAMPLES:
    # Copy a directory into an existing directory
    dcp /data/src /backup/ --summary

    # Copy two sources, preserving metadata, with progress
    dcp -p --progress /data/a /data/b /backup/

    # Save the file list, then copy a subtree from it later without walking
    dcp -o list.jsonl /data /backup/
    dcp -i list.jsonl /data/projects /backup/"
)]
struct Args {
    // Copy options
    /// Preserve ownership, permissions and timestamps
    #[arg(short, long, help_heading = "Copy options")]
    preserve: bool,

    /// Bypass the page cache: open destinations with O_DSYNC and drop cached pages after each write
    #[arg(short, long, help_heading = "Copy options")]
    synchronous: bool,

    /// Create sparse files: zero-filled blocks are skipped instead of written
    #[arg(short = 'S', long, help_heading = "Copy options")]
    sparse: bool,

    /// Copy only the named sources, do not descend into directories
    #[arg(long, help_heading = "Copy options")]
    no_recursive: bool,

    /// Chunk size for splitting large files into independent copy tasks
    #[arg(
        long,
        default_value = "1MiB",
        value_name = "SIZE",
        help_heading = "Copy options"
    )]
    chunk_size: bytesize::ByteSize,

    // File lists
    /// Read the file list from this file instead of walking the sources
    ///
    /// The positional sources select which entries of the list are copied and how their paths
    /// are mapped onto the destination.
    #[arg(short, long, value_name = "FILE", help_heading = "File lists")]
    input: Option<std::path::PathBuf>,

    /// Write the enumerated file list to this file (JSON lines)
    #[arg(short, long, value_name = "FILE", help_heading = "File lists")]
    output: Option<std::path::PathBuf>,

    // Scheduling
    /// Number of copy workers, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Scheduling"
    )]
    workers: usize,

    /// How an idle worker picks whom to steal from
    #[arg(
        long,
        default_value = "random",
        value_name = "POLICY",
        help_heading = "Scheduling"
    )]
    victim: common::scheduler::VictimSelection,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Sets the delay between progress updates, default is 200ms
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Log everything (implies "summary")
    #[arg(short = 'v', long = "verbose", help_heading = "Progress & output")]
    verbose: bool,

    /// Logging level: fatal, err, warn, info or dbg
    #[arg(
        short = 'd',
        long = "debug",
        default_value = "info",
        value_name = "LEVEL",
        help_heading = "Progress & output"
    )]
    debug: common::LogLevel,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of runtime worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source path(s) followed by the destination path
    #[arg(required = true, num_args = 2.., value_name = "PATHS")]
    paths: Vec<String>,
}

#[instrument(skip(prog_track))]
async fn async_main(
    args: Args,
    prog_track: std::sync::Arc<common::progress::Progress>,
) -> Result<common::Summary> {
    let (dest, sources) = args
        .paths
        .split_last()
        .ok_or_else(|| anyhow!("missing destination"))?;
    let mut source_paths = Vec::with_capacity(sources.len());
    for source in sources {
        source_paths.push(
            common::path::ParamPath::resolve(source)
                .await
                .with_context(|| format!("cannot resolve source {source:?}"))?,
        );
    }
    let dest = common::path::ParamPath::resolve(dest)
        .await
        .with_context(|| format!("cannot resolve destination {dest:?}"))?;
    let mut config = common::JobConfig::new(source_paths, dest);
    config.preserve = args.preserve;
    config.synchronous = args.synchronous;
    config.sparse = args.sparse;
    config.recursive = !args.no_recursive;
    config.chunk_size = args.chunk_size.as_u64();
    config.workers = args.workers;
    config.victim = args.victim;
    config.input = args.input.clone();
    config.output = args.output.clone();
    match common::dcp(std::sync::Arc::new(config), prog_track).await {
        Ok(summary) => Ok(summary),
        Err(error) => {
            if args.summary {
                return Err(anyhow!("{}\n\n{}", error, &error.summary));
            }
            Err(anyhow!("{}", error))
        }
    }
}

fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(error) => {
            let usage_error = error.use_stderr();
            // help and version requests are printed to stdout
            error.print()?;
            std::process::exit(if usage_error { 1 } else { 0 });
        }
    };
    let func = {
        let args = args.clone();
        move |prog_track| async_main(args, prog_track)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        log_level: args.debug,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(
        if args.progress || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_delay: args.progress_delay.clone(),
            })
        } else {
            None
        },
        output,
        runtime,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
