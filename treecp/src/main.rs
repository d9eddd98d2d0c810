use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "treecp",
    version,
    about = "Copy a directory tree, all or nothing",
    long_about = "`treecp` copies a directory tree, one concurrent task per file.

On success every file and directory in DESTINATION carries the content, permission bits and \
modification time of its counterpart in SOURCE. On failure everything the copy created is \
removed again; existing files are never overwritten.

EXAMPLE:
    # Back up a photo library into a new directory
    treecp ~/Pictures/2024 /mnt/backup/2024 --summary"
)]
struct Args {
    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of open files, 0 means no limit, leaving unspecified means using 80% of max open files system limit
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    /// Throttle the number of filesystem operations issued per second while walking the source, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
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
    /// Source directory
    #[arg()]
    src: std::path::PathBuf,

    /// Destination directory, created (with missing parents) if it does not exist
    #[arg()]
    dst: std::path::PathBuf,
}

#[instrument(skip(cancel))]
async fn async_main(
    args: Args,
    throttle: common::ThrottleConfig,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<common::copy::Summary> {
    let settings = common::copy::Settings {
        max_open_files: throttle.resolved_max_open_files(),
        ops_throttle: throttle.ops_throttle,
        cancel,
    };
    tracing::debug!("copy settings: {:?}", &settings);
    match common::copy_tree(&args.src, &args.dst, &settings).await {
        Ok(summary) => Ok(summary),
        Err(error) => {
            let mut message = format!("treecp: {error}");
            for diagnostic in &error.diagnostics {
                message.push_str(&format!("\n  {diagnostic}"));
            }
            if args.summary {
                return Err(anyhow!("{}\n\n{}", message, &error.summary));
            }
            Err(anyhow!("{}", message))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let throttle = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        ops_throttle: args.ops_throttle,
    };
    if let Err(error) = throttle.validate() {
        return Err(anyhow!("invalid throttle settings: {}", error));
    }
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let func = {
        let args = args.clone();
        move |cancel| async_main(args, throttle, cancel)
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
