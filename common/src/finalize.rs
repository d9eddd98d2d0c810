use anyhow::Context;
use std::os::unix::fs::PermissionsExt;
use tracing::instrument;

use crate::coordinator::Job;
use crate::error::Error;
use crate::planner::Directory;

fn mode_of(metadata: &std::fs::Metadata) -> std::fs::Permissions {
    std::fs::Permissions::from_mode(metadata.permissions().mode() & 0o7777)
}

/// Sets `path` permission bits (including setuid, setgid and sticky) to those in `metadata`.
pub(crate) async fn set_permissions(
    path: &std::path::Path,
    metadata: &std::fs::Metadata,
) -> anyhow::Result<()> {
    let permissions = mode_of(metadata);
    tokio::fs::set_permissions(path, permissions.clone())
        .await
        .with_context(|| format!("cannot set {:?} permissions to {:?}", &path, &permissions))
}

/// Sets `file` permission bits through an open handle.
pub(crate) async fn set_handle_permissions(
    file: &tokio::fs::File,
    path: &std::path::Path,
    metadata: &std::fs::Metadata,
) -> anyhow::Result<()> {
    let permissions = mode_of(metadata);
    file.set_permissions(permissions.clone())
        .await
        .with_context(|| format!("cannot set {:?} permissions to {:?}", &path, &permissions))
}

/// Sets access and modification time of `path` to the exact (nanosecond) values in `metadata`.
pub(crate) async fn set_times(
    path: &std::path::Path,
    metadata: &std::fs::Metadata,
) -> anyhow::Result<()> {
    let atime = filetime::FileTime::from_last_access_time(metadata);
    let mtime = filetime::FileTime::from_last_modification_time(metadata);
    let dst = path.to_owned();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        tracing::debug!("setting timestamps");
        filetime::set_file_times(&dst, atime, mtime)
            .with_context(|| format!("failed setting timestamps for {:?}", &dst))
    })
    .await?
}

async fn apply(path: &std::path::Path, metadata: &std::fs::Metadata) -> anyhow::Result<()> {
    set_permissions(path, metadata).await?;
    // timestamps last, nothing touches the inode after them
    set_times(path, metadata).await
}

/// Applies source permissions and timestamps to every destination path of a successful copy.
///
/// Files go first (reverse issue order), then directories in reverse pre-order so that every
/// directory is finalized after all of its descendants and the destination root comes last.
#[instrument(skip_all, fields(files = jobs.len(), directories = directories.len()))]
pub async fn finalize(jobs: &[Job], directories: &[Directory]) -> Result<(), Error> {
    for job in jobs.iter().rev() {
        let Some(copied) = job.copied() else {
            return Err(Error::io(anyhow::anyhow!(
                "cannot finalize {:?}, its copy did not succeed",
                job.dst()
            )));
        };
        apply(job.dst(), &copied.metadata).await.map_err(Error::io)?;
    }
    for dir in directories.iter().rev() {
        apply(&dir.dst, &dir.metadata).await.map_err(Error::io)?;
    }
    Ok(())
}
