use anyhow::{Context, anyhow};
use tracing::instrument;

use crate::error::{Error, ErrorKind};

/// What the validator learned about the destination.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Target {
    /// The destination root does not exist yet, the copy creates it and owns all of it.
    pub fresh: bool,
}

/// Checks tree copy preconditions, touching nothing on disk.
#[instrument]
pub async fn validate(src: &std::path::Path, dst: &std::path::Path) -> Result<Target, Error> {
    let src_metadata = match tokio::fs::metadata(src).await {
        Ok(src_metadata) => src_metadata,
        Err(error)
            if matches!(
                error.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
            ) =>
        {
            return Err(Error::new(
                ErrorKind::NotADirectory,
                anyhow::Error::from(error).context(format!("source {src:?} does not exist")),
            ));
        }
        Err(error) => {
            return Err(Error::io(
                anyhow::Error::from(error)
                    .context(format!("failed reading metadata from src: {src:?}")),
            ));
        }
    };
    if !src_metadata.is_dir() {
        return Err(Error::new(
            ErrorKind::NotADirectory,
            anyhow!("source {:?} is not a directory", src),
        ));
    }
    let fresh = match tokio::fs::metadata(dst).await {
        Ok(dst_metadata) if dst_metadata.is_dir() => false,
        Ok(_) => {
            return Err(Error::new(
                ErrorKind::NotADirectory,
                anyhow!("destination {:?} exists and is not a directory", dst),
            ));
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => true,
        Err(error) => {
            return Err(Error::io(
                anyhow::Error::from(error)
                    .context(format!("failed reading metadata from dst: {dst:?}")),
            ));
        }
    };
    let src_real = tokio::fs::canonicalize(src)
        .await
        .with_context(|| format!("cannot resolve {src:?}"))
        .map_err(Error::io)?;
    let dst_real = resolve(dst).await?;
    if dst_real.starts_with(&src_real) {
        return Err(Error::new(
            ErrorKind::NestedDestination,
            anyhow!("cannot copy {:?} into itself ({:?})", src, dst),
        ));
    }
    tracing::debug!("destination is fresh: {}", fresh);
    Ok(Target { fresh })
}

/// Canonicalizes the longest existing prefix of `path` and re-appends the rest.
async fn resolve(path: &std::path::Path) -> Result<std::path::PathBuf, Error> {
    let absolute = std::path::absolute(path)
        .with_context(|| format!("cannot resolve {path:?}"))
        .map_err(Error::io)?;
    let mut existing = absolute.as_path();
    let mut missing = vec![];
    loop {
        if let Ok(mut real) = tokio::fs::canonicalize(existing).await {
            for name in missing.iter().rev() {
                real.push(name);
            }
            return Ok(real);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_owned());
                existing = parent;
            }
            _ => return Ok(absolute),
        }
    }
}
