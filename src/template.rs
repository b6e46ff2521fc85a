//! Template Manager (component E): builds the shared project template once
//! (scaffold + install, or a build-time pre-warmed copy), then clones it for
//! every new project, regenerating `vite.config.ts` per clone.
//!
//! Single-flight `initialize()` follows the same watch-channel idiom as
//! [`crate::deps::DependencyHelper`], collapsed to a single global key since
//! there is only ever one template.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::deps::DependencyHelper;
use crate::error::OrchestratorError;
use crate::fsutil;
use crate::scaffold::{self, ScaffoldConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateState {
    NotInitialised,
    Initialising,
    Ready,
    Failed,
}

pub struct TemplateManager {
    config: Arc<AppConfig>,
    deps: DependencyHelper,
    state: RwLock<TemplateState>,
    inflight: Mutex<Option<watch::Receiver<Option<Result<(), String>>>>>,
}

impl TemplateManager {
    pub fn new(config: Arc<AppConfig>, deps: DependencyHelper) -> Self {
        Self {
            config,
            deps,
            state: RwLock::new(TemplateState::NotInitialised),
            inflight: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> TemplateState {
        *self.state.read().await
    }

    /// Idempotent: concurrent callers join the same in-flight job and
    /// receive its result rather than each running their own init.
    pub async fn initialize(&self) -> Result<(), OrchestratorError> {
        if *self.state.read().await == TemplateState::Ready {
            return Ok(());
        }

        let mut guard = self.inflight.lock().await;
        if let Some(rx) = guard.as_ref() {
            let mut rx = rx.clone();
            drop(guard);
            let _ = rx.wait_for(|v| v.is_some()).await;
            return rx
                .borrow()
                .clone()
                .expect("watch value set before notify")
                .map_err(OrchestratorError::InstallFailure);
        }

        let (tx, rx) = watch::channel(None);
        *guard = Some(rx);
        drop(guard);

        *self.state.write().await = TemplateState::Initialising;
        let result = self.run_initialize().await;
        *self.state.write().await = if result.is_ok() {
            TemplateState::Ready
        } else {
            TemplateState::Failed
        };

        *self.inflight.lock().await = None;
        let _ = tx.send(Some(result.clone()));
        result.map_err(OrchestratorError::InstallFailure)
    }

    async fn run_initialize(&self) -> Result<(), String> {
        let template_dir = self.config.template_dir();

        if has_node_modules(&template_dir).await {
            info!(dir = %template_dir.display(), "template already populated, marking ready");
            return Ok(());
        }

        if let Some(prebuilt) = &self.config.prebuilt_template_dir {
            if has_node_modules(prebuilt).await {
                info!(from = %prebuilt.display(), to = %template_dir.display(), "copying build-time pre-warmed template");
                return fsutil::copy_dir_recursive(prebuilt, &template_dir)
                    .await
                    .map_err(|e| format!("copying pre-warmed template: {e}"));
            }
            warn!(path = %prebuilt.display(), "PREBUILT_TEMPLATE_DIR set but has no node_modules, falling back to slow path");
        }

        info!(dir = %template_dir.display(), "scaffolding template from scratch");
        if let Err(e) = self.slow_path(&template_dir).await {
            warn!(dir = %template_dir.display(), error = %e, "template init failed, cleaning partial directory");
            let _ = fsutil::remove_dir_if_exists(&template_dir).await;
            return Err(e);
        }
        Ok(())
    }

    async fn slow_path(&self, template_dir: &std::path::Path) -> Result<(), String> {
        tokio::fs::create_dir_all(template_dir)
            .await
            .map_err(|e| format!("creating template dir: {e}"))?;

        let scaffold_config = ScaffoldConfig {
            project_id: "_template".to_string(),
            project_name: "Template".to_string(),
            description: None,
            jsx_tagger_dep: self.config.jsx_tagger_dep.clone(),
            base_path: "/".to_string(),
            hmr_public_url: self.config.hmr_public_url("_template"),
            hmr_path: "/hmr".to_string(),
            public_https: self.config.public_https,
        };

        for file in scaffold::scaffold(&scaffold_config) {
            let path = template_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("creating {}: {e}", parent.display()))?;
            }
            tokio::fs::write(&path, file.contents)
                .await
                .map_err(|e| format!("writing {}: {e}", path.display()))?;
        }

        let result = self.deps.ensure(template_dir).await;
        if !result.success {
            return Err(format!(
                "dependency install failed: {}",
                result.logs.join("\n")
            ));
        }
        Ok(())
    }

    /// Clones the ready template into a fresh project directory and
    /// regenerates `vite.config.ts` for `project_id`. `project_dir` is the
    /// already-sanitised destination (see [`crate::project::sanitize_project_id`]).
    pub async fn create_from_template(
        &self,
        project_id: &str,
        project_dir: &std::path::Path,
    ) -> Result<(), OrchestratorError> {
        let template_dir = self.config.template_dir();
        if !has_node_modules(&template_dir).await {
            *self.state.write().await = TemplateState::NotInitialised;
            self.initialize().await?;
        }

        fsutil::remove_dir_if_exists(project_dir)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

        fsutil::copy_dir_recursive(&template_dir, project_dir)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

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
        let vite_config = scaffold::render_vite_config(&scaffold_config, &[], None);
        tokio::fs::write(project_dir.join("vite.config.ts"), vite_config)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

        Ok(())
    }
}

async fn has_node_modules(dir: &std::path::Path) -> bool {
    tokio::fs::metadata(dir.join("node_modules"))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
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
            max_instances: 20,
            idle_timeout_secs: 1800,
        })
    }

    #[tokio::test]
    async fn initialize_marks_ready_when_already_populated() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path().to_path_buf());
        tokio::fs::create_dir_all(config.template_dir().join("node_modules"))
            .await
            .unwrap();

        let mgr = TemplateManager::new(config, DependencyHelper::new("bun"));
        assert_eq!(mgr.state().await, TemplateState::NotInitialised);
        mgr.initialize().await.unwrap();
        assert_eq!(mgr.state().await, TemplateState::Ready);
    }

    #[tokio::test]
    async fn initialize_copies_prewarmed_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let prebuilt = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(prebuilt.path().join("node_modules"))
            .await
            .unwrap();
        tokio::fs::write(prebuilt.path().join("package.json"), b"{}")
            .await
            .unwrap();

        let mut config = (*test_config(tmp.path().to_path_buf())).clone();
        config.prebuilt_template_dir = Some(prebuilt.path().to_path_buf());
        let mgr = TemplateManager::new(Arc::new(config), DependencyHelper::new("bun"));

        mgr.initialize().await.unwrap();
        assert_eq!(mgr.state().await, TemplateState::Ready);
        assert!(tokio::fs::metadata(tmp.path().join("_template/package.json"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn initialize_slow_path_fails_cleanly_when_install_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path().to_path_buf());
        let mgr = TemplateManager::new(config.clone(), DependencyHelper::new("definitely-not-a-real-binary-xyz"));

        let result = mgr.initialize().await;
        assert!(result.is_err());
        assert_eq!(mgr.state().await, TemplateState::Failed);
        assert!(tokio::fs::metadata(config.template_dir()).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_initialize_calls_share_one_job() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path().to_path_buf());
        let mgr = Arc::new(TemplateManager::new(
            config,
            DependencyHelper::new("definitely-not-a-real-binary-xyz"),
        ));

        let m1 = mgr.clone();
        let m2 = mgr.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { m1.initialize().await.is_err() }),
            tokio::spawn(async move { m2.initialize().await.is_err() })
        );
        assert!(r1.unwrap());
        assert!(r2.unwrap());
    }

    #[tokio::test]
    async fn create_from_template_clones_and_rewrites_vite_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path().to_path_buf());
        tokio::fs::create_dir_all(config.template_dir().join("node_modules"))
            .await
            .unwrap();
        tokio::fs::write(
            config.template_dir().join("vite.config.ts"),
            "export default {}",
        )
        .await
        .unwrap();
        tokio::fs::write(config.template_dir().join("package.json"), "{}")
            .await
            .unwrap();

        let mgr = TemplateManager::new(config.clone(), DependencyHelper::new("bun"));
        let project_dir = config.project_dir("proj12345");
        mgr.create_from_template("proj12345", &project_dir)
            .await
            .unwrap();

        let vite = tokio::fs::read_to_string(project_dir.join("vite.config.ts"))
            .await
            .unwrap();
        assert!(vite.contains("base: \"/p/proj12345/\""));
        assert!(vite.contains("idPrefix: \"proj1234\""));
        assert!(tokio::fs::metadata(project_dir.join("package.json"))
            .await
            .is_ok());
    }
}
