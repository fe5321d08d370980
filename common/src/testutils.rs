/// Creates a small source tree inside a fresh temporary directory:
///
/// ```text
/// foo
/// |- 0.txt
/// |- bar
///    |- 1.txt
///    |- 2.txt
///    |- 3.txt
/// |- baz
///    |- 4.txt
///    |- 5.txt -> ../bar/2.txt
///    |- 6.txt -> (absolute path) .../foo/bar/3.txt
/// ```
pub async fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    let tmp_dir = tempfile::tempdir()?;
    let foo_path = tmp_dir.path().join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    tokio::fs::write(foo_path.join("0.txt"), "0").await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "2").await?;
    tokio::fs::write(bar_path.join("3.txt"), "3").await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    tokio::fs::write(baz_path.join("4.txt"), "4").await?;
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt")).await?;
    tokio::fs::symlink(bar_path.join("3.txt"), baz_path.join("6.txt")).await?;
    Ok(tmp_dir)
}

/// Asserts that `dst` mirrors `src`: same entries, same file contents, same symlink targets.
pub fn check_dirs_identical(src: &std::path::Path, dst: &std::path::Path) -> anyhow::Result<()> {
    use anyhow::Context;
    let src_md = std::fs::symlink_metadata(src)
        .with_context(|| format!("source {:?} is missing", src))?;
    let dst_md = std::fs::symlink_metadata(dst)
        .with_context(|| format!("destination {:?} is missing", dst))?;
    assert_eq!(
        src_md.file_type(),
        dst_md.file_type(),
        "{:?} vs {:?}",
        src,
        dst
    );
    if src_md.is_symlink() {
        assert_eq!(std::fs::read_link(src)?, std::fs::read_link(dst)?);
    } else if src_md.is_file() {
        assert_eq!(
            std::fs::read(src)?,
            std::fs::read(dst)?,
            "{:?} vs {:?}",
            src,
            dst
        );
    } else if src_md.is_dir() {
        let mut src_names: Vec<_> = std::fs::read_dir(src)?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<Result<_, _>>()?;
        let mut dst_names: Vec<_> = std::fs::read_dir(dst)?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<Result<_, _>>()?;
        src_names.sort();
        dst_names.sort();
        assert_eq!(src_names, dst_names, "{:?} vs {:?}", src, dst);
        for name in src_names {
            check_dirs_identical(&src.join(&name), &dst.join(&name))?;
        }
    }
    Ok(())
}
