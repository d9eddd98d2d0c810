use tracing::instrument;

use crate::copy::Summary;
use crate::coordinator::Job;
use crate::error::Diagnostic;
use crate::planner::Directory;

/// What a rollback managed to undo and what it could not.
#[derive(Debug, Default)]
pub struct Rollback {
    pub summary: Summary,
    pub diagnostics: Vec<Diagnostic>,
}

impl Rollback {
    fn record(&mut self, path: &std::path::Path, result: std::io::Result<()>, what: &str) -> bool {
        match result {
            Ok(()) => true,
            // nothing left to undo
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => false,
            Err(error) => {
                tracing::warn!("rollback: failed removing {} {:?}: {}", what, path, &error);
                self.diagnostics.push(Diagnostic::CleanupFailure {
                    path: path.to_owned(),
                    error: anyhow::Error::from(error)
                        .context(format!("failed removing {what} {path:?}")),
                });
                false
            }
        }
    }
}

/// Undoes a failed tree copy, best effort.
///
/// Files of jobs that succeeded on their own are removed in reverse issue order (failed jobs
/// already cleaned up after themselves). A destination root created by this copy is then removed
/// entirely, otherwise only the directories this copy created are removed, deepest first, and
/// only if empty. Missing parents created for the root go last, also only if empty.
#[instrument(skip_all, fields(jobs = jobs.len(), directories = directories.len()))]
pub async fn rollback(
    jobs: &[Job],
    directories: &[Directory],
    parents: &[std::path::PathBuf],
) -> Rollback {
    let mut rollback = Rollback::default();
    for job in jobs.iter().rev() {
        if job.copied().is_none() {
            continue;
        }
        let result = tokio::fs::remove_file(job.dst()).await;
        if rollback.record(job.dst(), result, "file") {
            rollback.summary.files_rolled_back += 1;
        }
    }
    match directories.first() {
        Some(root) if root.created => {
            tracing::debug!("removing fresh destination {:?}", &root.dst);
            let result = tokio::fs::remove_dir_all(&root.dst).await;
            if rollback.record(&root.dst, result, "directory") {
                rollback.summary.directories_rolled_back +=
                    directories.iter().filter(|dir| dir.created).count();
            }
        }
        _ => {
            for dir in directories.iter().rev().filter(|dir| dir.created) {
                // never recursive: anything still inside is not ours
                let result = tokio::fs::remove_dir(&dir.dst).await;
                if rollback.record(&dir.dst, result, "directory") {
                    rollback.summary.directories_rolled_back += 1;
                }
            }
        }
    }
    for parent in parents.iter().rev() {
        let result = tokio::fs::remove_dir(parent).await;
        if rollback.record(parent, result, "directory") {
            rollback.summary.directories_rolled_back += 1;
        }
    }
    rollback
}
