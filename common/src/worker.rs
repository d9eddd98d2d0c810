//! Single file copy: one source file into one exclusively created destination file.

use anyhow::{Context as _, anyhow};
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::error::{Error, ErrorKind, classify_create};
use crate::finalize;

/// Shared state every copy task of one tree copy gets a clone of.
#[derive(Clone, Debug, Default)]
pub struct Context {
    /// Bounds how many copies have files open at once.
    pub gate: throttle::Gate,
    /// Checked before every new I/O step.
    pub cancel: tokio_util::sync::CancellationToken,
}

/// Outcome of a successful file copy.
#[derive(Debug)]
pub struct Copied {
    pub bytes: u64,
    /// Source metadata as seen through the open source handle.
    pub metadata: std::fs::Metadata,
}

/// Outcome of a failed file copy.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct Failure {
    #[source]
    pub error: Error,
    /// Set when the partially written destination could not be removed.
    pub cleanup: Option<anyhow::Error>,
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Failure {
            error,
            cleanup: None,
        }
    }
}

fn check_cancelled(ctx: &Context, path: &std::path::Path) -> Result<(), Error> {
    if ctx.cancel.is_cancelled() {
        return Err(Error::cancelled(path));
    }
    Ok(())
}

/// Copies `src` to `dst`, refusing to overwrite an existing `dst`.
///
/// On success `dst` has the content, permission bits and timestamps of `src`. On failure
/// nothing is left at `dst`, unless removing the partial file failed too, in which case
/// [`Failure::cleanup`] says why.
#[instrument(skip(ctx))]
pub async fn copy_file(
    src: &std::path::Path,
    dst: &std::path::Path,
    ctx: &Context,
) -> Result<Copied, Failure> {
    let _open_file_guard = ctx.gate.permit().await;
    check_cancelled(ctx, src)?;
    tracing::debug!("opening 'src' for reading");
    let reader = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("cannot open {src:?} for reading"))
        .map_err(Error::io)?;
    let src_metadata = reader
        .metadata()
        .await
        .with_context(|| format!("failed reading metadata from {src:?}"))
        .map_err(Error::io)?;
    if !src_metadata.is_file() {
        return Err(Error::io(anyhow!(
            "cannot copy {:?}, unsupported file type: {:?}",
            src,
            src_metadata.file_type()
        ))
        .into());
    }
    check_cancelled(ctx, dst)?;
    tracing::debug!("creating 'dst'");
    let writer = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(dst)
        .await
        .map_err(|error| {
            let kind = classify_create(&error, ErrorKind::Io);
            Error::new(
                kind,
                anyhow::Error::from(error).context(format!("cannot create {dst:?}")),
            )
        })?;
    // from here on 'dst' is ours and must not outlive a failure
    match write_contents(reader, writer, src, dst, &src_metadata, ctx).await {
        Ok(bytes) => Ok(Copied {
            bytes,
            metadata: src_metadata,
        }),
        Err(error) => {
            tracing::debug!("removing partially written 'dst'");
            let cleanup = tokio::fs::remove_file(dst)
                .await
                .with_context(|| format!("failed removing partial copy {dst:?}"))
                .err();
            Err(Failure { error, cleanup })
        }
    }
}

/// Streams the data, closes both handles and applies the source timestamps.
///
/// Both handles are closed before this returns, on every path.
async fn write_contents(
    mut reader: tokio::fs::File,
    mut writer: tokio::fs::File,
    src: &std::path::Path,
    dst: &std::path::Path,
    src_metadata: &std::fs::Metadata,
    ctx: &Context,
) -> Result<u64, Error> {
    let result = stream(&mut reader, &mut writer, src, dst, src_metadata, ctx).await;
    // into_std waits for any in-flight write, dropping the result closes the descriptor
    drop(writer.into_std().await);
    drop(reader);
    let bytes = result?;
    check_cancelled(ctx, dst)?;
    tracing::debug!("setting timestamps");
    finalize::set_times(dst, src_metadata)
        .await
        .map_err(Error::io)?;
    Ok(bytes)
}

async fn stream(
    reader: &mut tokio::fs::File,
    writer: &mut tokio::fs::File,
    src: &std::path::Path,
    dst: &std::path::Path,
    src_metadata: &std::fs::Metadata,
    ctx: &Context,
) -> Result<u64, Error> {
    check_cancelled(ctx, dst)?;
    tracing::debug!("copying data");
    let bytes = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => return Err(Error::cancelled(dst)),
        res = tokio::io::copy(reader, writer) => res
            .with_context(|| format!("failed copying {src:?} to {dst:?}"))
            .map_err(Error::io)?,
    };
    if bytes != src_metadata.len() {
        tracing::warn!(
            "{:?} changed while copying: expected {} bytes, copied {}",
            src,
            src_metadata.len(),
            bytes
        );
    }
    tracing::debug!("setting permissions");
    finalize::set_handle_permissions(writer, dst, src_metadata)
        .await
        .map_err(Error::io)?;
    writer
        .flush()
        .await
        .with_context(|| format!("failed flushing {dst:?}"))
        .map_err(Error::io)?;
    writer
        .sync_all()
        .await
        .with_context(|| format!("failed closing {dst:?}"))
        .map_err(Error::io)?;
    Ok(bytes)
}

/// Starts [`copy_file`] as its own task, the handle is the completion signal.
pub fn spawn(
    src: std::path::PathBuf,
    dst: std::path::PathBuf,
    ctx: Context,
) -> tokio::task::JoinHandle<Result<Copied, Failure>> {
    tokio::spawn(async move { copy_file(&src, &dst, &ctx).await })
}
