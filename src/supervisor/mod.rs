//! Instance Supervisor (component F): per-project child-process lifecycle,
//! port pool, readiness probing, idle eviction, graceful shutdown, and a
//! structured event stream.
//!
//! The instance map and port pool are a single `Arc<RwLock<HashMap<K, _>>>`
//! pattern; the event stream is a broadcast channel, same shape as
//! `metrics`'s snapshot feed.

pub mod events;
pub mod process;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::deps::DependencyHelper;
use crate::error::OrchestratorError;
use crate::scaffold::{self, ScaffoldConfig};
pub use events::{EventBus, LogStream, SupervisorEvent};

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
}

struct Instance {
    project_id: String,
    port: u16,
    dir: PathBuf,
    state: InstanceState,
    last_active: Instant,
    child: Option<Child>,
}

/// Read-only view returned to callers; never exposes the child handle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub project_id: String,
    pub port: u16,
    pub state: InstanceState,
    pub preview_url: String,
    pub hmr_url: String,
    pub idle_secs: u64,
}

impl Instance {
    fn info(&self, config: &AppConfig) -> InstanceInfo {
        InstanceInfo {
            project_id: self.project_id.clone(),
            port: self.port,
            state: self.state,
            preview_url: format!("/p/{}/", self.project_id),
            hmr_url: config.hmr_public_url(&self.project_id),
            idle_secs: self.last_active.elapsed().as_secs(),
        }
    }
}

struct PortPool {
    free: VecDeque<u16>,
}

impl PortPool {
    fn new(range: std::ops::Range<u16>) -> Self {
        Self {
            free: range.collect(),
        }
    }
    fn allocate(&mut self) -> Option<u16> {
        self.free.pop_front()
    }
    fn release(&mut self, port: u16) {
        self.free.push_back(port);
    }
}

pub struct InstanceSupervisor {
    config: Arc<AppConfig>,
    deps: DependencyHelper,
    client: reqwest::Client,
    instances: RwLock<HashMap<String, Instance>>,
    ports: Mutex<PortPool>,
    events: EventBus,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InstanceSupervisor {
    pub fn new(config: Arc<AppConfig>, deps: DependencyHelper) -> Self {
        let range = config.port_range();
        Self {
            client: reqwest::Client::new(),
            ports: Mutex::new(PortPool::new(range)),
            config,
            deps,
            instances: RwLock::new(HashMap::new()),
            events: EventBus::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Starts the 60s idle-eviction sweeper. Call once, after construction.
    pub fn spawn_idle_sweeper(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                this.sweep_idle().await;
            }
        });
        // best-effort: if spawn_idle_sweeper is called twice, the earlier
        // handle is dropped (and keeps running) — callers should only call
        // this once, typically from main().
        if let Ok(mut guard) = self.sweeper.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn sweep_idle(&self) {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let stale: Vec<String> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .filter(|i| {
                    i.state == InstanceState::Running && i.last_active.elapsed() > idle_timeout
                })
                .map(|i| i.project_id.clone())
                .collect()
        };
        for project_id in stale {
            info!(project_id, "evicting idle instance");
            self.stop(&project_id).await;
        }
    }

    pub async fn get_instance(&self, project_id: &str) -> Option<InstanceInfo> {
        let instances = self.instances.read().await;
        instances.get(project_id).map(|i| i.info(&self.config))
    }

    pub async fn get_all(&self) -> Vec<InstanceInfo> {
        let instances = self.instances.read().await;
        instances.values().map(|i| i.info(&self.config)).collect()
    }

    pub async fn get_running_count(&self) -> usize {
        let instances = self.instances.read().await;
        instances
            .values()
            .filter(|i| i.state == InstanceState::Running)
            .count()
    }

    pub async fn get_preview_url(&self, project_id: &str) -> Option<String> {
        self.get_instance(project_id).await.map(|i| i.preview_url)
    }

    pub async fn get_hmr_url(&self, project_id: &str) -> Option<String> {
        self.get_instance(project_id).await.map(|i| i.hmr_url)
    }

    /// Backend port for a running instance, used by the proxy and HMR
    /// splicer to reach the child directly. Only present while `running`.
    pub async fn get_backend_port(&self, project_id: &str) -> Option<u16> {
        let instances = self.instances.read().await;
        instances
            .get(project_id)
            .filter(|i| i.state == InstanceState::Running)
            .map(|i| i.port)
    }

    pub async fn mark_active(&self, project_id: &str) {
        let mut instances = self.instances.write().await;
        if let Some(instance) = instances.get_mut(project_id) {
            instance.last_active = Instant::now();
        }
    }

    /// Idempotent: returns the existing instance (refreshing `lastActive` if
    /// it is `running`) rather than starting a second child for the same
    /// project. Takes `Arc<Self>` so the post-start crash monitor (below) can
    /// hold a handle back to the supervisor for the lifetime of the child.
    pub async fn start(
        self: &Arc<Self>,
        project_id: &str,
        dir: &std::path::Path,
    ) -> Result<InstanceInfo, OrchestratorError> {
        {
            let mut instances = self.instances.write().await;
            if let Some(instance) = instances.get_mut(project_id) {
                if instance.state == InstanceState::Running {
                    instance.last_active = Instant::now();
                }
                return Ok(instance.info(&self.config));
            }
        }

        let port = {
            let mut pool = self.ports.lock().await;
            pool.allocate().ok_or(OrchestratorError::NoCapacity)?
        };

        {
            let mut instances = self.instances.write().await;
            instances.insert(
                project_id.to_string(),
                Instance {
                    project_id: project_id.to_string(),
                    port,
                    dir: dir.to_path_buf(),
                    state: InstanceState::Starting,
                    last_active: Instant::now(),
                    child: None,
                },
            );
        }

        match self.try_start(project_id, dir, port).await {
            Ok(info) => {
                let supervisor = self.clone();
                let pid = project_id.to_string();
                tokio::spawn(async move { supervisor.watch_for_crash(pid).await });
                Ok(info)
            }
            Err(e) => {
                self.instances.write().await.remove(project_id);
                self.ports.lock().await.release(port);
                Err(e)
            }
        }
    }

    /// Polls the child every 500ms via `try_wait`. If it exits while the
    /// instance is neither `stopping` nor already removed (a graceful
    /// `stop()` takes the `Child` out of the record before terminating it,
    /// so this never races a deliberate stop), this is a crash: log, release
    /// the port, remove the record, and publish `exit`. No automatic
    /// restart — callers observe the absence via `get_instance == None` and
    /// re-create explicitly via `startPreview`.
    async fn watch_for_crash(self: Arc<Self>, project_id: String) {
        const POLL_INTERVAL: Duration = Duration::from_millis(500);
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(&project_id) else {
                return;
            };
            if instance.state == InstanceState::Stopping {
                return;
            }
            let Some(child) = instance.child.as_mut() else {
                return;
            };
            match child.try_wait() {
                Ok(None) => continue,
                Ok(Some(status)) => {
                    let port = instance.port;
                    instances.remove(&project_id);
                    drop(instances);
                    warn!(project_id, code = status.code(), "child exited unexpectedly, evicting instance");
                    self.ports.lock().await.release(port);
                    self.events.publish(SupervisorEvent::Exit {
                        project_id: project_id.clone(),
                        code: status.code(),
                    });
                    return;
                }
                Err(e) => {
                    warn!(project_id, error = %e, "try_wait failed on monitored child, giving up");
                    return;
                }
            }
        }
    }

    async fn try_start(
        &self,
        project_id: &str,
        dir: &std::path::Path,
        port: u16,
    ) -> Result<InstanceInfo, OrchestratorError> {
        self.preflight(project_id, dir).await?;

        let mut child = process::spawn_bundler(&self.config.bun_binary, dir, port)
            .map_err(|e| OrchestratorError::Internal(e.into()))?;
        process::forward_output(&mut child, project_id.to_string(), self.events.clone());

        if !process::wait_until_ready(&self.client, port).await {
            warn!(project_id, port, "instance did not become ready in time");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(OrchestratorError::StartupTimeout);
        }

        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(project_id)
            .expect("instance record present for the duration of try_start");
        instance.state = InstanceState::Running;
        instance.child = Some(child);
        instance.last_active = Instant::now();
        let info = instance.info(&self.config);
        drop(instances);

        info!(project_id, port, "instance started");
        self.events.publish(SupervisorEvent::Started {
            project_id: project_id.to_string(),
            port,
        });
        Ok(info)
    }

    /// Ensures the tagger transform is a declared dev dependency and that
    /// `vite.config.ts` advertises the correct `base`/HMR/tagger settings,
    /// regenerating the file from a known-good string when anything is
    /// missing (never by patching the existing file in place).
    async fn preflight(&self, project_id: &str, dir: &std::path::Path) -> Result<(), OrchestratorError> {
        let package_json = tokio::fs::read_to_string(dir.join("package.json"))
            .await
            .unwrap_or_default();
        if !package_json.contains("jsx-tagger") {
            let spec = format!("jsx-tagger@{}", self.config.jsx_tagger_dep);
            let result = self.deps.add(dir, &spec, true).await;
            if !result.success {
                return Err(OrchestratorError::InstallFailure(result.logs.join("\n")));
            }
        }

        let vite_path = dir.join("vite.config.ts");
        let existing = tokio::fs::read_to_string(&vite_path).await.unwrap_or_default();
        let scaffold_config = ScaffoldConfig {
            project_id: project_id.to_string(),
            project_name: project_id.to_string(),
            description: None,
            jsx_tagger_dep: self.config.jsx_tagger_dep.clone(),
            base_path: format!("/p/{project_id}/"),
            hmr_public_url: self.config.hmr_public_url(project_id),
            hmr_path: format!("/hmr/{project_id}"),
            public_https: self.config.public_https,
        };

        if vite_config_needs_regeneration(&existing, &scaffold_config) {
            let (extra_imports, alias_block) = extract_preserved_bits(&existing);
            let regenerated =
                scaffold::render_vite_config(&scaffold_config, &extra_imports, alias_block.as_deref());
            tokio::fs::write(&vite_path, regenerated)
                .await
                .map_err(|e| OrchestratorError::Internal(e.into()))?;
        }

        Ok(())
    }

    /// If present: transition to `stopping`, SIGTERM, race a 5s timer against
    /// exit, SIGKILL if still alive. No-op if no such instance.
    pub async fn stop(&self, project_id: &str) {
        let mut child = {
            let mut instances = self.instances.write().await;
            match instances.get_mut(project_id) {
                Some(instance) => {
                    instance.state = InstanceState::Stopping;
                    instance.child.take()
                }
                None => return,
            }
        };

        if let Some(child) = child.as_mut() {
            process::terminate(child, project_id).await;
        }

        let removed = {
            let mut instances = self.instances.write().await;
            instances.remove(project_id)
        };
        if let Some(instance) = removed {
            self.ports.lock().await.release(instance.port);
        }

        info!(project_id, "instance stopped");
        self.events.publish(SupervisorEvent::Stopped {
            project_id: project_id.to_string(),
        });
    }

    /// Stops every instance concurrently and cancels the idle sweeper.
    pub async fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        let project_ids: Vec<String> = self.instances.read().await.keys().cloned().collect();
        let stops = project_ids.iter().map(|id| self.stop(id));
        futures::future::join_all(stops).await;
    }
}

fn vite_config_needs_regeneration(content: &str, config: &ScaffoldConfig) -> bool {
    if content.is_empty() {
        return true;
    }
    let required = [
        format!("base: \"{}\"", config.base_path),
        "jsxTagger(".to_string(),
        format!("path: \"{}\"", config.hmr_path),
    ];
    required.iter().any(|needle| !content.contains(needle.as_str()))
}

/// Heuristically preserves user customisations across a from-scratch
/// regeneration: any `import ...` line that isn't one of the scaffolder's
/// own known imports, and a brace-balanced `resolve.alias` object literal.
fn extract_preserved_bits(content: &str) -> (Vec<String>, Option<String>) {
    let known_imports = ["defineConfig", "@vitejs/plugin-react", "jsxTagger"];
    let extra_imports: Vec<String> = content
        .lines()
        .filter(|line| line.trim_start().starts_with("import "))
        .filter(|line| !known_imports.iter().any(|k| line.contains(k)))
        .map(str::to_string)
        .collect();

    let alias_block = content.find("alias:").and_then(|idx| {
        let rest = &content[idx + "alias:".len()..];
        let start = rest.find('{')?;
        let bytes = rest.as_bytes();
        let mut depth = 0i32;
        for (i, &b) in bytes.iter().enumerate().skip(start) {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(rest[start..=i].to_string());
                    }
                }
                _ => {}
            }
        }
        None
    });

    (extra_imports, alias_block)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(data_dir: PathBuf) -> Arc<AppConfig> {
        Arc::new(AppConfig {
            port: 3000,
            data_dir,
            api_key: String::new(),
            api_secret: String::new(),
            public_host: "preview.example.com".into(),
            public_https: false,
            bun_binary: "definitely-not-a-real-binary-xyz".into(),
            jsx_tagger_dep: "file:/app/packages/vite-plugin-jsx-tagger".into(),
            prebuilt_template_dir: None,
            base_port: 5200,
            max_instances: 2,
            idle_timeout_secs: 1800,
        })
    }

    #[tokio::test]
    async fn start_fails_with_no_capacity_when_ports_exhausted() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path().to_path_buf());
        let supervisor = Arc::new(InstanceSupervisor::new(config, DependencyHelper::new("bun")));

        // Drain the pool directly without going through a real spawn.
        {
            let mut pool = supervisor.ports.lock().await;
            pool.free.clear();
        }

        let dir = tmp.path().join("proj");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let result = supervisor.start("proj", &dir).await;
        assert!(matches!(result, Err(OrchestratorError::NoCapacity)));
    }

    #[tokio::test]
    async fn start_with_missing_binary_releases_port_and_removes_record() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path().to_path_buf());
        let supervisor = Arc::new(InstanceSupervisor::new(config, DependencyHelper::new("definitely-not-a-real-binary-xyz")));

        let dir = tmp.path().join("proj");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("package.json"), "{\"devDependencies\":{\"jsx-tagger\":\"x\"}}")
            .await
            .unwrap();

        let result = supervisor.start("proj", &dir).await;
        assert!(result.is_err());
        assert!(supervisor.get_instance("proj").await.is_none());
        assert_eq!(supervisor.ports.lock().await.free.len(), 2);
    }

    #[tokio::test]
    async fn get_running_count_excludes_starting_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path().to_path_buf());
        let supervisor = InstanceSupervisor::new(config, DependencyHelper::new("bun"));
        assert_eq!(supervisor.get_running_count().await, 0);
    }

    #[test]
    fn vite_config_needs_regeneration_when_base_wrong() {
        let config = ScaffoldConfig {
            project_id: "abc".into(),
            project_name: "abc".into(),
            description: None,
            jsx_tagger_dep: "dep".into(),
            base_path: "/p/abc/".into(),
            hmr_public_url: "ws://x/hmr/abc".into(),
            hmr_path: "/hmr/abc".into(),
            public_https: false,
        };
        assert!(vite_config_needs_regeneration("", &config));
        assert!(vite_config_needs_regeneration("base: \"/p/other/\"", &config));
    }

    #[test]
    fn extract_preserved_bits_finds_alias_block_and_extra_imports() {
        let content = r#"
import { defineConfig } from "vite";
import react from "@vitejs/plugin-react";
import svgr from "vite-plugin-svgr";

export default defineConfig({
  resolve: {
    alias: { "@": "/src", "@lib": "/lib" },
  },
});
"#;
        let (imports, alias) = extract_preserved_bits(content);
        assert_eq!(imports.len(), 1);
        assert!(imports[0].contains("vite-plugin-svgr"));
        assert!(alias.unwrap().contains("\"@\": \"/src\""));
    }
}
