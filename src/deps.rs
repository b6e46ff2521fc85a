//! Dependency Helper (component C): wraps the external package manager
//! binary with single-flight-per-directory install coalescing.
//!
//! Single-flight uses the same `Arc<RwLock<HashMap<K, _>>>` get-or-create
//! shape used elsewhere in this crate; process spawn + log capture follows a
//! failure-is-a-value discipline — a non-zero exit or a spawn error becomes
//! `success: false` with logs, never a propagated error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::process::Command;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

/// Outcome of a single dependency operation.
#[derive(Debug, Clone)]
pub struct InstallResult {
    pub success: bool,
    pub duration_ms: u64,
    pub logs: Vec<String>,
}

impl InstallResult {
    fn ok(duration_ms: u64, logs: Vec<String>) -> Self {
        Self {
            success: true,
            duration_ms,
            logs,
        }
    }

    fn failed(duration_ms: u64, logs: Vec<String>) -> Self {
        Self {
            success: false,
            duration_ms,
            logs,
        }
    }
}

#[derive(Clone)]
pub struct DependencyHelper {
    bun_binary: String,
    inflight: Arc<RwLock<HashMap<PathBuf, watch::Receiver<Option<InstallResult>>>>>,
}

impl DependencyHelper {
    pub fn new(bun_binary: impl Into<String>) -> Self {
        Self {
            bun_binary: bun_binary.into(),
            inflight: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Skips the package manager entirely if `node_modules` already exists.
    /// Concurrent calls for the same `dir` share a single in-flight job.
    pub async fn install(&self, dir: &Path) -> InstallResult {
        if tokio::fs::metadata(dir.join("node_modules"))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return InstallResult::ok(0, vec!["node_modules present, skipping install".into()]);
        }
        self.single_flight(dir, &["install"]).await
    }

    /// Like [`install`](Self::install) but always runs the package manager,
    /// even if `node_modules` already exists (used to heal a partial tree).
    pub async fn ensure(&self, dir: &Path) -> InstallResult {
        self.single_flight(dir, &["install"]).await
    }

    /// Deletes `node_modules`, then installs fresh.
    pub async fn reinstall(&self, dir: &Path) -> InstallResult {
        if let Err(e) = tokio::fs::remove_dir_all(dir.join("node_modules")).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "failed to remove node_modules before reinstall");
            }
        }
        self.single_flight(dir, &["install"]).await
    }

    pub async fn add(&self, dir: &Path, package: &str, dev: bool) -> InstallResult {
        let mut args = vec!["add".to_string()];
        if dev {
            args.push("-d".to_string());
        }
        args.push(package.to_string());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(dir, &arg_refs).await
    }

    pub async fn remove(&self, dir: &Path, package: &str) -> InstallResult {
        self.run(dir, &["remove", package]).await
    }

    async fn single_flight(&self, dir: &Path, args: &[&str]) -> InstallResult {
        let key = dir.to_path_buf();

        if let Some(result) = self.join_inflight(&key).await {
            return result;
        }

        let (tx, rx) = watch::channel(None);
        {
            let mut guard = self.inflight.write().await;
            // Re-check under the write lock: another task may have become
            // leader between our read-lock release and this write-lock.
            if let Some(existing) = guard.get(&key) {
                let mut rx = existing.clone();
                drop(guard);
                let _ = rx.wait_for(|v| v.is_some()).await;
                return rx.borrow().clone().expect("watch value set before notify");
            }
            guard.insert(key.clone(), rx);
        }

        let result = self.run(dir, args).await;

        {
            let mut guard = self.inflight.write().await;
            guard.remove(&key);
        }
        let _ = tx.send(Some(result.clone()));
        result
    }

    async fn join_inflight(&self, key: &PathBuf) -> Option<InstallResult> {
        let guard = self.inflight.read().await;
        let mut rx = guard.get(key)?.clone();
        drop(guard);
        let _ = rx.wait_for(|v| v.is_some()).await;
        Some(rx.borrow().clone().expect("watch value set before notify"))
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> InstallResult {
        let started = Instant::now();
        info!(dir = %dir.display(), bin = %self.bun_binary, args = ?args, "running package manager");

        let output = Command::new(&self.bun_binary)
            .args(args)
            .current_dir(dir)
            .env("CI", "true") // non-interactive mode
            .kill_on_drop(true)
            .output()
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;

        match output {
            Ok(output) => {
                let mut logs = Vec::new();
                logs.extend(String::from_utf8_lossy(&output.stdout).lines().map(str::to_string));
                logs.extend(String::from_utf8_lossy(&output.stderr).lines().map(str::to_string));
                if output.status.success() {
                    InstallResult::ok(duration_ms, logs)
                } else {
                    warn!(dir = %dir.display(), status = %output.status, "package manager exited non-zero");
                    InstallResult::failed(duration_ms, logs)
                }
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to spawn package manager");
                InstallResult::failed(duration_ms, vec![format!("spawn error: {e}")])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_skips_when_node_modules_present() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(tmp.path().join("node_modules")).await.unwrap();

        let helper = DependencyHelper::new("bun");
        let result = helper.install(tmp.path()).await;
        assert!(result.success);
        assert_eq!(result.duration_ms, 0);
    }

    #[tokio::test]
    async fn install_runs_when_absent_and_binary_missing_is_value_not_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = DependencyHelper::new("definitely-not-a-real-binary-xyz");
        let result = helper.install(tmp.path()).await;
        assert!(!result.success);
        assert!(!result.logs.is_empty());
    }

    #[tokio::test]
    async fn concurrent_install_single_flights() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = DependencyHelper::new("definitely-not-a-real-binary-xyz");

        let h1 = {
            let helper = helper.clone();
            let path = tmp.path().to_path_buf();
            tokio::spawn(async move { helper.install(&path).await })
        };
        let h2 = {
            let helper = helper.clone();
            let path = tmp.path().to_path_buf();
            tokio::spawn(async move { helper.install(&path).await })
        };

        let (r1, r2) = tokio::join!(h1, h2);
        let r1 = r1.unwrap();
        let r2 = r2.unwrap();
        assert_eq!(r1.success, r2.success);
        assert_eq!(r1.logs, r2.logs);
    }

    #[tokio::test]
    async fn reinstall_removes_node_modules_first() {
        let tmp = tempfile::tempdir().unwrap();
        let nm = tmp.path().join("node_modules");
        tokio::fs::create_dir(&nm).await.unwrap();
        tokio::fs::write(nm.join("marker"), b"x").await.unwrap();

        let helper = DependencyHelper::new("definitely-not-a-real-binary-xyz");
        let _ = helper.reinstall(tmp.path()).await;

        assert!(!nm.join("marker").exists());
    }

    #[tokio::test]
    async fn reinstall_missing_node_modules_does_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = DependencyHelper::new("definitely-not-a-real-binary-xyz");
        let result = helper.reinstall(tmp.path()).await;
        assert!(!result.success); // binary still missing, but no panic
    }
}
