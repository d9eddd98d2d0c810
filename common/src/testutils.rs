use anyhow::{Context, anyhow};
use async_recursion::async_recursion;
use std::os::unix::fs::{MetadataExt, PermissionsExt};

pub fn set_mtime(path: &std::path::Path, secs: i64, nanos: u32) -> anyhow::Result<()> {
    let time = filetime::FileTime::from_unix_time(secs, nanos);
    filetime::set_file_times(path, time, time)
        .with_context(|| format!("failed setting times on {path:?}"))
}

async fn write_file(
    path: &std::path::Path,
    content: &str,
    mode: u32,
    secs: i64,
) -> anyhow::Result<()> {
    tokio::fs::write(path, content).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    set_mtime(path, secs, 123_456_789)
}

pub async fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    let tmp_dir = tempfile::tempdir()?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- empty.txt
    let foo_path = tmp_dir.path().join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    write_file(&foo_path.join("0.txt"), "0", 0o644, 1_600_000_000).await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    write_file(&bar_path.join("1.txt"), "1", 0o640, 1_600_000_001).await?;
    write_file(&bar_path.join("2.txt"), "2", 0o600, 1_600_000_002).await?;
    write_file(&bar_path.join("3.txt"), "3", 0o604, 1_600_000_003).await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    write_file(&baz_path.join("4.txt"), "4", 0o664, 1_600_000_004).await?;
    write_file(&baz_path.join("empty.txt"), "", 0o444, 1_600_000_005).await?;
    // directories last, writing into them moves their mtime
    tokio::fs::set_permissions(&bar_path, std::fs::Permissions::from_mode(0o755)).await?;
    tokio::fs::set_permissions(&baz_path, std::fs::Permissions::from_mode(0o750)).await?;
    set_mtime(&bar_path, 1_600_000_010, 1)?;
    set_mtime(&baz_path, 1_600_000_011, 2)?;
    set_mtime(&foo_path, 1_600_000_012, 3)?;
    Ok(tmp_dir)
}

/// Fails unless `dst` mirrors `src`: same entries, content, permission bits and mtime.
#[async_recursion]
pub async fn check_dirs_identical(
    src: &std::path::Path,
    dst: &std::path::Path,
) -> anyhow::Result<()> {
    check_metadata(src, dst).await?;
    let mut src_names = vec![];
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        src_names.push(entry.file_name());
    }
    let mut dst_names = vec![];
    let mut entries = tokio::fs::read_dir(dst).await?;
    while let Some(entry) = entries.next_entry().await? {
        dst_names.push(entry.file_name());
    }
    src_names.sort();
    dst_names.sort();
    if src_names != dst_names {
        return Err(anyhow!(
            "{:?} has {:?}, {:?} has {:?}",
            src,
            src_names,
            dst,
            dst_names
        ));
    }
    for name in src_names {
        let src_path = src.join(&name);
        let dst_path = dst.join(&name);
        if tokio::fs::symlink_metadata(&src_path).await?.is_dir() {
            check_dirs_identical(&src_path, &dst_path).await?;
        } else {
            check_metadata(&src_path, &dst_path).await?;
            let src_content = tokio::fs::read(&src_path).await?;
            let dst_content = tokio::fs::read(&dst_path).await?;
            if src_content != dst_content {
                return Err(anyhow!("content of {:?} differs from {:?}", dst_path, src_path));
            }
        }
    }
    Ok(())
}

async fn check_metadata(src: &std::path::Path, dst: &std::path::Path) -> anyhow::Result<()> {
    let src_md = tokio::fs::metadata(src).await?;
    let dst_md = tokio::fs::symlink_metadata(dst).await?;
    if src_md.file_type() != dst_md.file_type() {
        return Err(anyhow!("{:?} and {:?} have different types", src, dst));
    }
    if src_md.mode() & 0o7777 != dst_md.mode() & 0o7777 {
        return Err(anyhow!(
            "mode of {:?} is {:o}, expected {:o}",
            dst,
            dst_md.mode() & 0o7777,
            src_md.mode() & 0o7777
        ));
    }
    if (src_md.mtime(), src_md.mtime_nsec()) != (dst_md.mtime(), dst_md.mtime_nsec()) {
        return Err(anyhow!(
            "mtime of {:?} is {}.{:09}, expected {}.{:09}",
            dst,
            dst_md.mtime(),
            dst_md.mtime_nsec(),
            src_md.mtime(),
            src_md.mtime_nsec()
        ));
    }
    Ok(())
}
