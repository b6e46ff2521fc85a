//! Small filesystem helpers shared by the Template Manager and Project
//! Manager: recursive copy, recursive delete-if-present, and a file counter
//! that excludes `node_modules`/`.git` the way every project listing and
//! status query must.

use std::path::Path;

use futures::future::{BoxFuture, FutureExt};

const PRUNED_DIRS: &[&str] = &["node_modules", ".git"];

/// `cp -R src dst`. Creates `dst` (and parents) if absent. Symlinks are
/// skipped rather than followed or copied as links, to avoid escaping the
/// project tree via a crafted symlink inside user-controlled content.
pub fn copy_dir_recursive<'a>(src: &'a Path, dst: &'a Path) -> BoxFuture<'a, std::io::Result<()>> {
    async move {
        tokio::fs::create_dir_all(dst).await?;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let src_path = entry.path();
            let dst_path = dst.join(entry.file_name());
            if file_type.is_dir() {
                copy_dir_recursive(&src_path, &dst_path).await?;
            } else if file_type.is_file() {
                tokio::fs::copy(&src_path, &dst_path).await?;
            }
        }
        Ok(())
    }
    .boxed()
}

/// Removes `path` if present; a missing path is not an error.
pub async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Counts regular files under `root`, pruning `node_modules` and `.git`
/// subtrees entirely (matching `list_files`'s traversal, below).
pub fn count_files<'a>(root: &'a Path) -> BoxFuture<'a, std::io::Result<u64>> {
    async move {
        let mut count = 0u64;
        let mut entries = tokio::fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name();
            if file_type.is_dir() {
                if PRUNED_DIRS.iter().any(|p| name.to_str() == Some(p)) {
                    continue;
                }
                count += count_files(&entry.path()).await?;
            } else if file_type.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }
    .boxed()
}

/// Recursively lists file paths under `root` relative to it, pruning
/// `node_modules` and `.git`.
pub fn list_files_relative<'a>(root: &'a Path) -> BoxFuture<'a, std::io::Result<Vec<String>>> {
    async move {
        let mut out = Vec::new();
        collect_relative(root, root, &mut out).await?;
        Ok(out)
    }
    .boxed()
}

fn collect_relative<'a>(
    root: &'a Path,
    dir: &'a Path,
    out: &'a mut Vec<String>,
) -> BoxFuture<'a, std::io::Result<()>> {
    async move {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name();
            if file_type.is_dir() {
                if PRUNED_DIRS.iter().any(|p| name.to_str() == Some(p)) {
                    continue;
                }
                collect_relative(root, &entry.path(), out).await?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(())
    }
    .boxed()
}

/// Latest modification time under `root`, pruning `node_modules`/`.git`.
/// `None` if the tree is empty or unreadable.
pub fn latest_mtime<'a>(
    root: &'a Path,
) -> BoxFuture<'a, std::io::Result<Option<std::time::SystemTime>>> {
    async move {
        let mut latest: Option<std::time::SystemTime> = None;
        let mut entries = tokio::fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name();
            if file_type.is_dir() {
                if PRUNED_DIRS.iter().any(|p| name.to_str() == Some(p)) {
                    continue;
                }
                if let Some(t) = latest_mtime(&entry.path()).await? {
                    latest = Some(latest.map_or(t, |cur| cur.max(t)));
                }
            } else {
                let meta = entry.metadata().await?;
                if let Ok(modified) = meta.modified() {
                    latest = Some(latest.map_or(modified, |cur| cur.max(modified)));
                }
            }
        }
        Ok(latest)
    }
    .boxed()
}
