use anyhow::anyhow;
use tracing::instrument;

use crate::copy::Summary;
use crate::error::{Diagnostic, Error, ErrorKind};
use crate::worker;

#[derive(Debug)]
enum JobState {
    Running(tokio::task::JoinHandle<Result<worker::Copied, worker::Failure>>),
    Succeeded(worker::Copied),
    Failed(ErrorKind),
}

/// One planned file copy and its outcome.
#[derive(Debug)]
pub struct Job {
    src: std::path::PathBuf,
    dst: std::path::PathBuf,
    state: JobState,
}

impl Job {
    #[must_use]
    pub fn src(&self) -> &std::path::Path {
        &self.src
    }

    #[must_use]
    pub fn dst(&self) -> &std::path::Path {
        &self.dst
    }

    /// The copy result, once the coordinator has observed a success.
    #[must_use]
    pub fn copied(&self) -> Option<&worker::Copied> {
        match &self.state {
            JobState::Succeeded(copied) => Some(copied),
            _ => None,
        }
    }

    /// The failure class, once the coordinator has observed a failure.
    #[must_use]
    pub fn failed(&self) -> Option<ErrorKind> {
        match &self.state {
            JobState::Failed(kind) => Some(*kind),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_observed(&self) -> bool {
        !matches!(self.state, JobState::Running(_))
    }
}

/// Result of awaiting every issued job.
#[derive(Debug, Default)]
pub struct Collected {
    /// First failure in issue order.
    pub canonical: Option<Error>,
    pub diagnostics: Vec<Diagnostic>,
    pub summary: Summary,
}

/// Starts one copy task per issued job and collects them in issue order.
#[derive(Debug)]
pub struct Coordinator {
    ctx: worker::Context,
    jobs: Vec<Job>,
}

impl Coordinator {
    #[must_use]
    pub fn new(ctx: worker::Context) -> Self {
        Self { ctx, jobs: vec![] }
    }

    /// Spawns the copy of `src` to `dst` right away and records it as the next job.
    pub fn issue(&mut self, src: std::path::PathBuf, dst: std::path::PathBuf) {
        tracing::trace!("issuing job #{}: {:?} -> {:?}", self.jobs.len(), &src, &dst);
        let handle = worker::spawn(src.clone(), dst.clone(), self.ctx.clone());
        self.jobs.push(Job {
            src,
            dst,
            state: JobState::Running(handle),
        });
    }

    #[must_use]
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Awaits every job strictly in issue order.
    ///
    /// The first failing job (by issue order, not by completion time) supplies the canonical
    /// error, every later failure is kept as a diagnostic. Returns only after all jobs finished.
    #[instrument(skip(self), fields(jobs = self.jobs.len()))]
    pub async fn collect(&mut self) -> Collected {
        let mut collected = Collected::default();
        for job in &mut self.jobs {
            let JobState::Running(handle) = &mut job.state else {
                continue;
            };
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(worker::Failure::from(Error::io(anyhow!(
                    "copy task for {:?} did not finish: {}",
                    &job.dst,
                    join_error
                )))),
            };
            match outcome {
                Ok(copied) => {
                    collected.summary.files_copied += 1;
                    collected.summary.bytes_copied += copied.bytes;
                    job.state = JobState::Succeeded(copied);
                }
                Err(mut failure) => {
                    job.state = JobState::Failed(failure.error.kind());
                    if let Some(cleanup) = failure.cleanup.take() {
                        collected.diagnostics.push(Diagnostic::CleanupFailure {
                            path: job.dst.clone(),
                            error: cleanup,
                        });
                    }
                    if collected.canonical.is_none() {
                        tracing::error!(
                            "copy: {:?} -> {:?} failed: {}",
                            &job.src,
                            &job.dst,
                            &failure
                        );
                        collected.canonical = Some(failure.error);
                    } else {
                        tracing::debug!(
                            "copy: {:?} -> {:?} also failed: {}",
                            &job.src,
                            &job.dst,
                            &failure
                        );
                        collected.diagnostics.push(Diagnostic::SecondaryFailure {
                            path: job.dst.clone(),
                            error: failure.error,
                        });
                    }
                }
            }
        }
        collected
    }
}
