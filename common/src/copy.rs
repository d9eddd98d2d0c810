use tracing::instrument;

use crate::coordinator::Coordinator;
use crate::error::{Diagnostic, ErrorKind};
use crate::finalize;
use crate::planner::{Directory, Planner};
use crate::rollback;
use crate::validate;
use crate::worker;

/// Error type for tree copies that keeps the operation summary and every secondary problem.
///
/// # Logging Convention
/// The Display implementation shows the full chain of the canonical error, so you can log it
/// with any format specifier:
/// ```ignore
/// tracing::error!("copy failed: {}", &error);
/// tracing::error!("copy failed: {:#}", &error);
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct Error {
    /// The first failure by job issue order, this is what the copy failed with.
    #[source]
    pub source: crate::error::Error,
    pub summary: Summary,
    /// Later failures and failed cleanups, never replacing `source`.
    pub diagnostics: Vec<Diagnostic>,
}

impl Error {
    #[must_use]
    pub fn new(source: crate::error::Error, summary: Summary) -> Self {
        Error {
            source,
            summary,
            diagnostics: vec![],
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Maximum number of open files, `0` means no limit; each running copy holds two.
    pub max_open_files: usize,
    /// Filesystem operations per second issued by the walk, `0` means no throttle.
    pub ops_throttle: usize,
    /// Cancels the copy; work in flight stops before its next I/O step and is rolled back.
    pub cancel: tokio_util::sync::CancellationToken,
}

impl Settings {
    fn gate(&self) -> throttle::Gate {
        if self.max_open_files == 0 {
            return throttle::Gate::unbounded();
        }
        throttle::Gate::new(std::cmp::max(1, self.max_open_files / 2))
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub directories_created: usize,
    pub directories_unchanged: usize,
    pub files_rolled_back: usize,
    pub directories_rolled_back: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            directories_created: self.directories_created + other.directories_created,
            directories_unchanged: self.directories_unchanged + other.directories_unchanged,
            files_rolled_back: self.files_rolled_back + other.files_rolled_back,
            directories_rolled_back: self.directories_rolled_back + other.directories_rolled_back,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            directories created: {}\n\
            directories unchanged: {}\n\
            files rolled back: {}\n\
            directories rolled back: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.directories_created,
            self.directories_unchanged,
            self.files_rolled_back,
            self.directories_rolled_back,
        )
    }
}

fn directory_summary(directories: &[Directory], parents: &[std::path::PathBuf]) -> Summary {
    let created = directories.iter().filter(|dir| dir.created).count();
    Summary {
        directories_created: created + parents.len(),
        directories_unchanged: directories.len() - created,
        ..Default::default()
    }
}

/// Copies the directory tree `src` into `dst`, all or nothing.
///
/// Every file is copied by its own task. On success every destination entry carries the content,
/// permission bits and modification time of its source. On failure everything this call created
/// is removed again (best effort) and the first failure in walk order is returned.
#[instrument(skip(settings))]
pub async fn copy_tree(
    src: &std::path::Path,
    dst: &std::path::Path,
    settings: &Settings,
) -> Result<Summary, Error> {
    let target = validate::validate(src, dst)
        .await
        .map_err(|err| Error::new(err, Default::default()))?;
    let ops = throttle::OpsThrottle::per_second(settings.ops_throttle);
    let replenish_cancel = tokio_util::sync::CancellationToken::new();
    // stops the replenish task on every return path
    let _replenish_guard = replenish_cancel.clone().drop_guard();
    if ops.is_enabled() {
        let ops = ops.clone();
        tokio::spawn(async move { ops.run_replenish(replenish_cancel).await });
    }
    let ctx = worker::Context {
        gate: settings.gate(),
        cancel: settings.cancel.clone(),
    };
    let mut planner = Planner::new(Coordinator::new(ctx), ops, settings.cancel.clone());
    let walk_result = planner.plan(src, dst, target.fresh).await;
    let (mut coordinator, directories, parents) = planner.into_parts();
    tracing::debug!("waiting for {} copy jobs", coordinator.jobs().len());
    let collected = coordinator.collect().await;
    let mut summary = collected.summary + directory_summary(&directories, &parents);
    let mut diagnostics = collected.diagnostics;
    // the walk error ranks after every job issued before the walk stopped
    let canonical = match (collected.canonical, walk_result) {
        (Some(error), Err(walk_error)) => {
            diagnostics.push(Diagnostic::SecondaryFailure {
                path: src.to_owned(),
                error: walk_error,
            });
            Some(error)
        }
        (Some(error), Ok(())) => Some(error),
        (None, Err(walk_error)) => Some(walk_error),
        (None, Ok(())) => None,
    };
    let canonical = match canonical {
        Some(error) => error,
        None => match finalize::finalize(coordinator.jobs(), &directories).await {
            Ok(()) => return Ok(summary),
            Err(error) => error,
        },
    };
    tracing::error!("copy: {:?} -> {:?} failed: {}", src, dst, &canonical);
    let undone = rollback::rollback(coordinator.jobs(), &directories, &parents).await;
    summary = summary + undone.summary;
    diagnostics.extend(undone.diagnostics);
    Err(Error {
        source: canonical,
        summary,
        diagnostics,
    })
}

#[cfg(test)]
mod copy_tests {
    use crate::testutils;
    use std::os::unix::fs::PermissionsExt;
    use tracing_test::traced_test;

    use super::*;

    #[tokio::test]
    #[traced_test]
    async fn check_basic_copy() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let summary = copy_tree(
            &test_path.join("foo"),
            &test_path.join("bar"),
            &Settings::default(),
        )
        .await?;
        assert_eq!(summary.files_copied, 6);
        assert_eq!(summary.directories_created, 3);
        assert_eq!(summary.bytes_copied, 5);
        testutils::check_dirs_identical(&test_path.join("foo"), &test_path.join("bar")).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn copy_into_missing_parents() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let reference = test_path.join("reference");
        tokio::fs::create_dir(&reference).await?;
        let default_mode = tokio::fs::metadata(&reference).await?.permissions().mode();
        let dst = test_path.join("backups").join("2024").join("bar");
        let summary = copy_tree(&test_path.join("foo"), &dst, &Settings::default()).await?;
        assert_eq!(summary.directories_created, 5);
        testutils::check_dirs_identical(&test_path.join("foo"), &dst).await?;
        // parents are plain directories, not copies of anything
        for parent in [test_path.join("backups"), test_path.join("backups").join("2024")] {
            let mode = tokio::fs::metadata(&parent).await?.permissions().mode();
            assert_eq!(mode, default_mode);
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_copy_removes_created_parents() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        tokio::fs::symlink(test_path.join("nowhere"), test_path.join("foo").join("broken.lnk"))
            .await?;
        let dst = test_path.join("backups").join("2024").join("bar");
        let error = copy_tree(&test_path.join("foo"), &dst, &Settings::default())
            .await
            .expect_err("dangling link must fail the copy");
        assert_eq!(error.kind(), ErrorKind::Io);
        assert!(error.diagnostics.is_empty());
        assert!(!test_path.join("backups").exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn walk_error_rolls_back_issued_jobs() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src");
        tokio::fs::create_dir(&src).await?;
        tokio::fs::write(src.join("a.txt"), "alpha").await?;
        let long_name = "x".repeat(150);
        tokio::fs::create_dir(src.join(&long_name)).await?;
        // a destination deep enough that "a.txt" still fits in PATH_MAX but the directory does not
        let mut prefix = tmp_dir.path().join("deep");
        while prefix.as_os_str().len() < 3990 {
            prefix.push("p".repeat(50));
        }
        tokio::fs::create_dir_all(&prefix).await?;
        let dst = prefix.join("dst");
        let error = copy_tree(&src, &dst, &Settings::default())
            .await
            .expect_err("mkdir past PATH_MAX must fail the walk");
        assert_eq!(error.kind(), ErrorKind::Walk);
        assert_eq!(error.summary.files_copied, 1);
        assert_eq!(error.summary.files_rolled_back, 1);
        assert!(!dst.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn huge_limits_do_not_abort() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let settings = Settings {
            max_open_files: usize::MAX,
            ops_throttle: usize::MAX,
            ..Default::default()
        };
        let summary = copy_tree(&test_path.join("foo"), &test_path.join("bar"), &settings).await?;
        assert_eq!(summary.files_copied, 6);
        testutils::check_dirs_identical(&test_path.join("foo"), &test_path.join("bar")).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn scenario_a_nested_file() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src");
        tokio::fs::create_dir_all(src.join("sub")).await?;
        tokio::fs::write(src.join("a.txt"), "alpha").await?;
        tokio::fs::write(src.join("sub").join("b.txt"), "beta").await?;
        tokio::fs::set_permissions(src.join("a.txt"), std::fs::Permissions::from_mode(0o604))
            .await?;
        testutils::set_mtime(&src.join("a.txt"), 1_300_000_000, 42)?;
        testutils::set_mtime(&src.join("sub").join("b.txt"), 1_300_000_001, 43)?;
        testutils::set_mtime(&src.join("sub"), 1_300_000_002, 44)?;
        let dst = tmp_dir.path().join("dst");
        copy_tree(&src, &dst, &Settings::default()).await?;
        assert_eq!(tokio::fs::read_to_string(dst.join("a.txt")).await?, "alpha");
        assert_eq!(
            tokio::fs::read_to_string(dst.join("sub").join("b.txt")).await?,
            "beta"
        );
        testutils::check_dirs_identical(&src, &dst).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn scenario_b_existing_file_is_untouched() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src");
        let dst = tmp_dir.path().join("dst");
        tokio::fs::create_dir(&src).await?;
        tokio::fs::create_dir(&dst).await?;
        tokio::fs::write(src.join("a.txt"), "new content").await?;
        tokio::fs::write(dst.join("a.txt"), "old").await?;
        let error = copy_tree(&src, &dst, &Settings::default())
            .await
            .expect_err("copy over an existing file must fail");
        assert_eq!(error.kind(), ErrorKind::Exists);
        assert_eq!(tokio::fs::read_to_string(dst.join("a.txt")).await?, "old");
        assert!(dst.is_dir());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn conflict_rolls_back_everything_else() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let dst = test_path.join("bar");
        tokio::fs::create_dir_all(dst.join("baz")).await?;
        tokio::fs::write(dst.join("baz").join("4.txt"), "precious").await?;
        let error = copy_tree(&test_path.join("foo"), &dst, &Settings::default())
            .await
            .expect_err("conflicting destination must fail");
        tracing::info!("{}", &error);
        assert_eq!(error.kind(), ErrorKind::Exists);
        assert!(error.diagnostics.is_empty());
        assert_eq!(error.summary.files_copied, 5);
        assert_eq!(error.summary.files_rolled_back, 5);
        assert_eq!(error.summary.directories_rolled_back, 1);
        assert_eq!(
            tokio::fs::read_to_string(dst.join("baz").join("4.txt")).await?,
            "precious"
        );
        assert!(!dst.join("0.txt").exists());
        assert!(!dst.join("bar").exists());
        assert!(!dst.join("baz").join("empty.txt").exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_file_removes_fresh_destination() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        // a dangling link cannot be opened for reading, regardless of who runs the test
        let link = test_path.join("foo").join("bar").join("2.txt.lnk");
        tokio::fs::symlink(test_path.join("nowhere"), &link).await?;
        let dst = test_path.join("bar");
        let error = copy_tree(&test_path.join("foo"), &dst, &Settings::default())
            .await
            .expect_err("dangling link must fail the copy");
        assert_eq!(error.kind(), ErrorKind::Io);
        assert!(format!("{error}").contains("2.txt.lnk"));
        assert_eq!(error.summary.files_copied, 6);
        assert_eq!(error.summary.files_rolled_back, 6);
        assert!(!dst.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn first_failure_in_walk_order_wins() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let foo = test_path.join("foo");
        // "bar/1.lnk" comes before "baz/0.lnk" in walk order
        tokio::fs::symlink(test_path.join("nowhere"), foo.join("baz").join("0.lnk")).await?;
        tokio::fs::symlink(test_path.join("nowhere"), foo.join("bar").join("1.lnk")).await?;
        let error = copy_tree(&foo, &test_path.join("bar"), &Settings::default())
            .await
            .expect_err("dangling links must fail the copy");
        assert!(format!("{error}").contains("1.lnk"));
        assert_eq!(error.diagnostics.len(), 1);
        assert!(error.diagnostics[0].path().ends_with("baz/0.lnk"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn cancelled_copy_rolls_back() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let settings = Settings::default();
        settings.cancel.cancel();
        let dst = test_path.join("bar");
        let error = copy_tree(&test_path.join("foo"), &dst, &settings)
            .await
            .expect_err("cancelled copy must fail");
        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert!(!dst.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn bounded_fan_out() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let settings = Settings {
            max_open_files: 2,
            ops_throttle: 1000,
            ..Default::default()
        };
        let summary = copy_tree(&test_path.join("foo"), &test_path.join("bar"), &settings).await?;
        assert_eq!(summary.files_copied, 6);
        testutils::check_dirs_identical(&test_path.join("foo"), &test_path.join("bar")).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn copy_into_existing_destination() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let dst = test_path.join("bar");
        tokio::fs::create_dir(&dst).await?;
        tokio::fs::write(dst.join("unrelated.txt"), "keep").await?;
        let summary = copy_tree(&test_path.join("foo"), &dst, &Settings::default()).await?;
        assert_eq!(summary.files_copied, 6);
        assert_eq!(summary.directories_created, 2);
        assert_eq!(summary.directories_unchanged, 1);
        assert_eq!(tokio::fs::read_to_string(dst.join("unrelated.txt")).await?, "keep");
        assert_eq!(tokio::fs::read_to_string(dst.join("bar").join("1.txt")).await?, "1");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn read_only_directories_are_finalized_last() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let baz = test_path.join("foo").join("baz");
        tokio::fs::set_permissions(&baz, std::fs::Permissions::from_mode(0o500)).await?;
        testutils::set_mtime(&baz, 1_200_000_000, 7)?;
        let result = copy_tree(
            &test_path.join("foo"),
            &test_path.join("bar"),
            &Settings::default(),
        )
        .await;
        let check =
            testutils::check_dirs_identical(&test_path.join("foo"), &test_path.join("bar")).await;
        // let the temp dir clean up after itself
        for dir in [baz, test_path.join("bar").join("baz")] {
            if dir.exists() {
                tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
            }
        }
        result?;
        check?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn nested_destination_is_refused() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.path().join("foo");
        let error = copy_tree(&foo, &foo.join("backup"), &Settings::default())
            .await
            .expect_err("copying into itself must fail");
        assert_eq!(error.kind(), ErrorKind::NestedDestination);
        assert!(!foo.join("backup").exists());
        Ok(())
    }

    mod properties {
        use super::super::*;
        use crate::testutils;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]

            #[test]
            fn any_tree_copies_identically(
                files in prop::collection::vec(
                    (
                        prop::collection::vec(0u8..3, 0..3),
                        0u8..4,
                        prop::collection::vec(any::<u8>(), 0..256),
                    ),
                    0..16,
                )
            ) {
                let tmp_dir = tempfile::tempdir().unwrap();
                let src = tmp_dir.path().join("src");
                std::fs::create_dir(&src).unwrap();
                for (dirs, file, content) in &files {
                    let mut path = src.clone();
                    for dir in dirs {
                        path.push(format!("d{dir}"));
                    }
                    std::fs::create_dir_all(&path).unwrap();
                    path.push(format!("f{file}.bin"));
                    std::fs::write(&path, content).unwrap();
                }
                let dst = tmp_dir.path().join("dst");
                let runtime = tokio::runtime::Runtime::new().unwrap();
                runtime.block_on(async {
                    copy_tree(&src, &dst, &Settings::default()).await.unwrap();
                    testutils::check_dirs_identical(&src, &dst).await.unwrap();
                });
            }
        }
    }
}
