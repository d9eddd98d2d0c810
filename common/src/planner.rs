use anyhow::{Context, anyhow};
use async_recursion::async_recursion;
use tracing::instrument;

use crate::coordinator::Coordinator;
use crate::error::{Error, ErrorKind, classify_create};

/// Mode for directories created while copying, widened to the source mode once all is done.
const DIR_CREATE_MODE: u32 = 0o700;

/// A directory visited by the walk.
#[derive(Debug)]
pub struct Directory {
    pub src: std::path::PathBuf,
    pub dst: std::path::PathBuf,
    pub metadata: std::fs::Metadata,
    /// `false` when the destination directory already existed and was copied into.
    pub created: bool,
}

/// Walks the source tree, creating destination directories inline and issuing one job per file.
#[derive(Debug)]
pub struct Planner {
    coordinator: Coordinator,
    directories: Vec<Directory>,
    parents: Vec<std::path::PathBuf>,
    ops: throttle::OpsThrottle,
    cancel: tokio_util::sync::CancellationToken,
}

impl Planner {
    #[must_use]
    pub fn new(
        coordinator: Coordinator,
        ops: throttle::OpsThrottle,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            directories: vec![],
            parents: vec![],
            ops,
            cancel,
        }
    }

    /// Visited directories in pre-order, the destination root first.
    #[must_use]
    pub fn directories(&self) -> &[Directory] {
        &self.directories
    }

    /// Missing ancestors of a fresh destination created by this walk, outermost first.
    #[must_use]
    pub fn parents(&self) -> &[std::path::PathBuf] {
        &self.parents
    }

    #[must_use]
    pub fn into_parts(self) -> (Coordinator, Vec<Directory>, Vec<std::path::PathBuf>) {
        (self.coordinator, self.directories, self.parents)
    }

    /// Plans the copy of `src` into `dst`.
    ///
    /// `fresh` means `dst` does not exist yet and is created here. Its missing ancestors are
    /// created one by one with the default mode and recorded in [`Planner::parents`]. On error
    /// the walk stops, jobs issued so far keep running.
    #[instrument(skip(self))]
    pub async fn plan(
        &mut self,
        src: &std::path::Path,
        dst: &std::path::Path,
        fresh: bool,
    ) -> Result<(), Error> {
        let src_metadata = tokio::fs::metadata(src)
            .await
            .with_context(|| format!("failed reading metadata from src: {src:?}"))
            .map_err(Error::walk)?;
        if fresh {
            self.create_parents(dst).await?;
            tracing::debug!("creating destination root");
            // never recursive: a root that appeared since validation is not ours
            tokio::fs::DirBuilder::new()
                .mode(DIR_CREATE_MODE)
                .create(dst)
                .await
                .map_err(|error| {
                    Error::new(
                        classify_create(&error, ErrorKind::Walk),
                        anyhow::Error::from(error)
                            .context(format!("cannot create directory {dst:?}")),
                    )
                })?;
        }
        self.directories.push(Directory {
            src: src.to_owned(),
            dst: dst.to_owned(),
            metadata: src_metadata,
            created: fresh,
        });
        self.walk(src, dst).await
    }

    async fn create_parents(&mut self, dst: &std::path::Path) -> Result<(), Error> {
        let mut missing = vec![];
        let mut current = dst.parent();
        while let Some(parent) = current {
            if parent.as_os_str().is_empty() {
                break;
            }
            match tokio::fs::symlink_metadata(parent).await {
                Ok(_) => break,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    missing.push(parent.to_owned());
                }
                Err(error) => {
                    return Err(Error::walk(
                        anyhow::Error::from(error)
                            .context(format!("failed reading metadata from {parent:?}")),
                    ));
                }
            }
            current = parent.parent();
        }
        for parent in missing.into_iter().rev() {
            tracing::debug!("creating missing parent {:?}", &parent);
            match tokio::fs::create_dir(&parent).await {
                Ok(()) => self.parents.push(parent),
                // created by someone else in the meantime
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(error) => {
                    return Err(Error::walk(
                        anyhow::Error::from(error)
                            .context(format!("cannot create directory {parent:?}")),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn next_op(&self, path: &std::path::Path) -> Result<(), Error> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::cancelled(path)),
            () = self.ops.token() => Ok(()),
        }
    }

    #[async_recursion]
    async fn walk(&mut self, src: &std::path::Path, dst: &std::path::Path) -> Result<(), Error> {
        self.next_op(src).await?;
        tracing::debug!("reading directory {:?}", src);
        let mut entries = tokio::fs::read_dir(src)
            .await
            .with_context(|| format!("cannot open directory {src:?} for reading"))
            .map_err(Error::walk)?;
        let mut names = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing src directory {src:?}"))
            .map_err(Error::walk)?
        {
            names.push(entry.file_name());
        }
        // release the directory handle before descending
        drop(entries);
        names.sort();
        for name in names {
            self.next_op(src).await?;
            let src_path = src.join(&name);
            let dst_path = dst.join(&name);
            let metadata = tokio::fs::symlink_metadata(&src_path)
                .await
                .with_context(|| format!("failed reading metadata from {src_path:?}"))
                .map_err(Error::walk)?;
            if metadata.is_dir() {
                let created = create_dir(&dst_path).await?;
                self.directories.push(Directory {
                    src: src_path.clone(),
                    dst: dst_path.clone(),
                    metadata,
                    created,
                });
                self.walk(&src_path, &dst_path).await?;
            } else {
                self.coordinator.issue(src_path, dst_path);
            }
        }
        Ok(())
    }
}

/// Creates `dst`, returns `false` if a directory was already there.
async fn create_dir(dst: &std::path::Path) -> Result<bool, Error> {
    let error = match tokio::fs::DirBuilder::new()
        .mode(DIR_CREATE_MODE)
        .create(dst)
        .await
    {
        Ok(()) => return Ok(true),
        Err(error) => error,
    };
    if error.kind() != std::io::ErrorKind::AlreadyExists {
        return Err(Error::walk(
            anyhow::Error::from(error).context(format!("cannot create directory {dst:?}")),
        ));
    }
    let dst_metadata = tokio::fs::symlink_metadata(dst)
        .await
        .with_context(|| format!("failed reading metadata from dst: {dst:?}"))
        .map_err(Error::walk)?;
    if !dst_metadata.is_dir() {
        return Err(Error::new(
            ErrorKind::Exists,
            anyhow!("cannot create directory {:?}, a non-directory is in the way", dst),
        ));
    }
    tracing::debug!("{:?} is a directory, copying into it", dst);
    Ok(false)
}
