//! Core library for the phorg tree copy tool
//!
//! The entry point is [`copy_tree`]: it replicates a source directory tree into a destination,
//! copying every regular file in its own task, and either produces a complete mirror (content,
//! permission bits and modification times) or removes whatever it created.
//!
//! # Stages
//!
//! - [`validate`] checks both paths before anything is touched
//! - [`planner`] walks the source depth-first in name order, creating destination directories
//!   and issuing one copy job per file through the [`coordinator`]
//! - [`worker`] copies one file into an exclusively created destination file
//! - [`coordinator`] awaits the jobs in issue order, the first failure by that order wins
//! - [`finalize`] applies permissions and times, files first, then directories deepest first
//! - [`rollback`] undoes a failed copy, best effort
//!
//! # Error Handling
//!
//! Every failure is classified by [`ErrorKind`]. A failed [`copy_tree`] returns a
//! [`copy::Error`] carrying the canonical error, the [`copy::Summary`] of what was done and
//! undone, and the [`Diagnostic`]s for every other failure.
//!
//! # Bootstrap
//!
//! [`run`] sets up logging, builds the tokio runtime, wires Ctrl-C to a cancellation token and
//! reports the result, so binaries only parse their arguments.

pub mod config;
pub mod coordinator;
pub mod copy;
pub mod error;
pub mod finalize;
pub mod planner;
pub mod rollback;
pub mod validate;
pub mod worker;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig};
pub use copy::copy_tree;
pub use error::{Diagnostic, Error, ErrorKind};

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_logging(output: &OutputConfig) {
    if output.quiet {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level(output.verbose)));
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("failed to initialize logging: {error}");
    }
}

fn build_runtime(runtime: &RuntimeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build()
}

/// Runs `func` on a fresh runtime and reports its outcome.
///
/// The token passed to `func` is cancelled on Ctrl-C. Returns `None` if `func` failed (the error
/// is printed to stderr unless quiet) or the runtime could not be started.
pub fn run<Fut, S, E>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce(tokio_util::sync::CancellationToken) -> Fut,
) -> Option<S>
where
    S: std::fmt::Display,
    E: std::fmt::Display,
    Fut: std::future::Future<Output = Result<S, E>>,
{
    init_logging(&output);
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start the tokio runtime: {error}");
            }
            return None;
        }
    };
    let cancel = tokio_util::sync::CancellationToken::new();
    let res = runtime.block_on(async {
        let interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, cancelling and rolling back");
                    cancel.cancel();
                }
            }
        });
        let res = func(cancel).await;
        interrupt.abort();
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
