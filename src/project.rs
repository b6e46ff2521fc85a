//! Project Manager (component I): the single entry point tying together the
//! Template Manager (E), Dependency Helper (C) and Instance Supervisor (F)
//! into the project CRUD + lifecycle operations the control plane exposes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::AppConfig;
use crate::deps::DependencyHelper;
use crate::error::OrchestratorError;
use crate::fsutil;
use crate::scaffold::{self, ScaffoldConfig, TEMPLATE_SKIP_LIST};
use crate::supervisor::InstanceSupervisor;
use crate::template::TemplateManager;

/// Sanitises a caller-supplied project id to `[A-Za-z0-9_-]` by dropping
/// every other character — this also strips `.`/`..`/`/`, so the result is
/// always a single path segment with no traversal components, never an
/// error for an otherwise-well-formed id. Only rejects what filtering can't
/// fix: an empty input, one over length, or one with nothing left after
/// filtering.
pub fn sanitize_project_id(id: &str) -> Result<String, OrchestratorError> {
    if id.is_empty() || id.len() > 128 {
        return Err(OrchestratorError::BadRequest(
            "projectId must be 1-128 characters".into(),
        ));
    }
    let sanitized: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if sanitized.is_empty() {
        return Err(OrchestratorError::BadRequest(
            "projectId has no valid characters after sanitisation".into(),
        ));
    }
    Ok(sanitized)
}

/// Joins `rel` under `base`, rejecting absolute paths and any `..` segment.
fn safe_join(base: &Path, rel: &str) -> Result<PathBuf, OrchestratorError> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(OrchestratorError::BadRequest("path must be relative".into()));
    }
    if rel_path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(OrchestratorError::BadRequest(
            "path must not contain '..'".into(),
        ));
    }
    Ok(base.join(rel_path))
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Create,
    #[default]
    Update,
    Delete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileUpdate {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub operation: FileOp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitialFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub project_id: String,
    pub project_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub files: Vec<InitialFile>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResult {
    pub dir: String,
    pub port: u16,
    pub preview_url: String,
    pub hmr_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub exists: bool,
    pub dev_server_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub file_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

pub struct ProjectManager {
    config: Arc<AppConfig>,
    deps: DependencyHelper,
    template: Arc<TemplateManager>,
    supervisor: Arc<InstanceSupervisor>,
}

impl ProjectManager {
    pub fn new(
        config: Arc<AppConfig>,
        deps: DependencyHelper,
        template: Arc<TemplateManager>,
        supervisor: Arc<InstanceSupervisor>,
    ) -> Self {
        Self {
            config,
            deps,
            template,
            supervisor,
        }
    }

    pub fn project_dir(&self, sanitized_id: &str) -> PathBuf {
        self.config.project_dir(sanitized_id)
    }

    pub async fn create(&self, req: CreateProjectRequest) -> Result<CreateResult, OrchestratorError> {
        let id = sanitize_project_id(&req.project_id)?;
        if req.project_name.trim().is_empty() {
            return Err(OrchestratorError::BadRequest("projectName is required".into()));
        }
        let dir = self.project_dir(&id);

        if self.template.state().await == crate::template::TemplateState::Ready {
            self.template.create_from_template(&id, &dir).await?;
            self.write_user_files(&dir, &req.files).await?;
            self.merge_extra_dependencies(&dir, &req.files).await?;
        } else {
            self.slow_path_create(&id, &dir, &req).await?;
        }

        let info = self.supervisor.start(&id, &dir).await?;
        info!(project_id = %id, port = info.port, "project created and preview started");
        Ok(CreateResult {
            dir: dir.display().to_string(),
            port: info.port,
            preview_url: info.preview_url,
            hmr_url: info.hmr_url,
        })
    }

    async fn slow_path_create(
        &self,
        id: &str,
        dir: &Path,
        req: &CreateProjectRequest,
    ) -> Result<(), OrchestratorError> {
        let scaffold_config = ScaffoldConfig {
            project_id: id.to_string(),
            project_name: req.project_name.clone(),
            description: req.description.clone(),
            jsx_tagger_dep: self.config.jsx_tagger_dep.clone(),
            base_path: format!("/p/{id}/"),
            hmr_public_url: self.config.hmr_public_url(id),
            hmr_path: format!("/hmr/{id}"),
            public_https: self.config.public_https,
        };
        fsutil::remove_dir_if_exists(dir)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;
        for file in scaffold::scaffold(&scaffold_config) {
            let path = dir.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| OrchestratorError::Internal(e.into()))?;
            }
            tokio::fs::write(&path, file.contents)
                .await
                .map_err(|e| OrchestratorError::Internal(e.into()))?;
        }
        self.write_user_files(dir, &req.files).await?;
        let result = self.deps.ensure(dir).await;
        if !result.success {
            return Err(OrchestratorError::InstallFailure(result.logs.join("\n")));
        }
        Ok(())
    }

    /// Writes caller-supplied initial files, refusing to overwrite anything
    /// on the config skip-list so the template's resolved dependency tree
    /// stays intact.
    async fn write_user_files(&self, dir: &Path, files: &[InitialFile]) -> Result<(), OrchestratorError> {
        for file in files {
            if TEMPLATE_SKIP_LIST.contains(&file.path.as_str()) {
                continue;
            }
            let path = safe_join(dir, &file.path)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| OrchestratorError::Internal(e.into()))?;
            }
            tokio::fs::write(&path, &file.content)
                .await
                .map_err(|e| OrchestratorError::Internal(e.into()))?;
        }
        Ok(())
    }

    /// If the caller's initial files included a `package.json` carrying
    /// dependencies not already present in the cloned template manifest,
    /// merges the delta in and installs it.
    async fn merge_extra_dependencies(&self, dir: &Path, files: &[InitialFile]) -> Result<(), OrchestratorError> {
        let Some(user_pkg) = files.iter().find(|f| f.path == "package.json") else {
            return Ok(());
        };
        let Ok(user_json): Result<serde_json::Value, _> = serde_json::from_str(&user_pkg.content) else {
            return Ok(());
        };

        let manifest_path = dir.join("package.json");
        let existing = tokio::fs::read_to_string(&manifest_path)
            .await
            .unwrap_or_else(|_| "{}".to_string());
        let mut existing_json: serde_json::Value =
            serde_json::from_str(&existing).unwrap_or_else(|_| serde_json::json!({}));

        let mut changed = false;
        for key in ["dependencies", "devDependencies"] {
            let Some(user_deps) = user_json.get(key).and_then(|v| v.as_object()) else {
                continue;
            };
            let existing_deps = existing_json
                .as_object_mut()
                .unwrap()
                .entry(key)
                .or_insert_with(|| serde_json::json!({}));
            let existing_deps = existing_deps.as_object_mut().unwrap();
            for (name, version) in user_deps {
                if !existing_deps.contains_key(name) {
                    existing_deps.insert(name.clone(), version.clone());
                    changed = true;
                }
            }
        }

        if changed {
            let rendered = serde_json::to_string_pretty(&existing_json)
                .map_err(|e| OrchestratorError::Internal(e.into()))?;
            tokio::fs::write(&manifest_path, rendered)
                .await
                .map_err(|e| OrchestratorError::Internal(e.into()))?;
            let result = self.deps.ensure(dir).await;
            if !result.success {
                return Err(OrchestratorError::InstallFailure(result.logs.join("\n")));
            }
        }
        Ok(())
    }

    pub async fn get_status(&self, project_id: &str) -> Result<ProjectStatus, OrchestratorError> {
        let id = sanitize_project_id(project_id)?;
        let dir = self.project_dir(&id);
        if tokio::fs::metadata(&dir).await.is_err() {
            return Ok(ProjectStatus {
                exists: false,
                dev_server_running: false,
                port: None,
                file_count: 0,
                last_modified: None,
            });
        }

        let instance = self.supervisor.get_instance(&id).await;
        let file_count = fsutil::count_files(&dir).await.unwrap_or(0);
        let last_modified = fsutil::latest_mtime(&dir)
            .await
            .ok()
            .flatten()
            .map(DateTime::<Utc>::from);

        Ok(ProjectStatus {
            exists: true,
            dev_server_running: instance
                .as_ref()
                .map(|i| i.state == crate::supervisor::InstanceState::Running)
                .unwrap_or(false),
            port: instance.map(|i| i.port),
            file_count,
            last_modified,
        })
    }

    pub async fn update_files(&self, project_id: &str, updates: Vec<FileUpdate>) -> Result<(), OrchestratorError> {
        let id = sanitize_project_id(project_id)?;
        let dir = self.project_dir(&id);
        self.ensure_exists(&dir).await?;

        for update in updates {
            let path = safe_join(&dir, &update.path)?;
            match update.operation {
                FileOp::Create | FileOp::Update => {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| OrchestratorError::Internal(e.into()))?;
                    }
                    tokio::fs::write(&path, update.content)
                        .await
                        .map_err(|e| OrchestratorError::Internal(e.into()))?;
                }
                FileOp::Delete => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(OrchestratorError::Internal(e.into()));
                        }
                    }
                }
            }
        }

        self.supervisor.mark_active(&id).await;
        Ok(())
    }

    pub async fn read_file(&self, project_id: &str, rel_path: &str) -> Result<String, OrchestratorError> {
        let id = sanitize_project_id(project_id)?;
        let dir = self.project_dir(&id);
        let path = safe_join(&dir, rel_path)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| OrchestratorError::NotFound(format!("file not found: {rel_path}")))
    }

    pub async fn list_files(&self, project_id: &str) -> Result<Vec<String>, OrchestratorError> {
        let id = sanitize_project_id(project_id)?;
        let dir = self.project_dir(&id);
        self.ensure_exists(&dir).await?;
        fsutil::list_files_relative(&dir)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))
    }

    pub async fn start_preview(&self, project_id: &str) -> Result<CreateResult, OrchestratorError> {
        let id = sanitize_project_id(project_id)?;
        let dir = self.project_dir(&id);
        self.ensure_exists(&dir).await?;
        let result = self.deps.ensure(&dir).await;
        if !result.success {
            return Err(OrchestratorError::InstallFailure(result.logs.join("\n")));
        }
        let info = self.supervisor.start(&id, &dir).await?;
        Ok(CreateResult {
            dir: dir.display().to_string(),
            port: info.port,
            preview_url: info.preview_url,
            hmr_url: info.hmr_url,
        })
    }

    pub async fn stop_preview(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let id = sanitize_project_id(project_id)?;
        self.supervisor.stop(&id).await;
        Ok(())
    }

    pub async fn delete(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let id = sanitize_project_id(project_id)?;
        self.supervisor.stop(&id).await;
        let dir = self.project_dir(&id);
        fsutil::remove_dir_if_exists(&dir)
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))
    }

    pub async fn reinstall_dependencies(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let id = sanitize_project_id(project_id)?;
        let dir = self.project_dir(&id);
        self.ensure_exists(&dir).await?;
        self.supervisor.stop(&id).await;
        let result = self.deps.reinstall(&dir).await;
        if !result.success {
            return Err(OrchestratorError::InstallFailure(result.logs.join("\n")));
        }
        self.supervisor.start(&id, &dir).await?;
        Ok(())
    }

    pub async fn add_dependency(&self, project_id: &str, package: &str, dev: bool) -> Result<(), OrchestratorError> {
        let id = sanitize_project_id(project_id)?;
        let dir = self.project_dir(&id);
        self.ensure_exists(&dir).await?;
        let result = self.deps.add(&dir, package, dev).await;
        if !result.success {
            return Err(OrchestratorError::InstallFailure(result.logs.join("\n")));
        }
        Ok(())
    }

    pub async fn remove_dependency(&self, project_id: &str, package: &str) -> Result<(), OrchestratorError> {
        let id = sanitize_project_id(project_id)?;
        let dir = self.project_dir(&id);
        self.ensure_exists(&dir).await?;
        let result = self.deps.remove(&dir, package).await;
        if !result.success {
            return Err(OrchestratorError::InstallFailure(result.logs.join("\n")));
        }
        Ok(())
    }

    async fn ensure_exists(&self, dir: &Path) -> Result<(), OrchestratorError> {
        if tokio::fs::metadata(dir).await.is_err() {
            return Err(OrchestratorError::NotFound("project not found".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_accepts_alphanumeric_dash_underscore() {
        assert_eq!(sanitize_project_id("abc-123_XYZ").unwrap(), "abc-123_XYZ");
    }

    #[test]
    fn sanitize_strips_traversal_to_a_single_safe_segment() {
        let sanitized = sanitize_project_id("../etc/passwd").unwrap();
        assert_eq!(sanitized, "etcpasswd");
        assert!(!sanitized.contains(".."));
        assert!(!sanitized.contains('/'));
    }

    #[test]
    fn sanitize_strips_slash() {
        assert_eq!(sanitize_project_id("a/b").unwrap(), "ab");
    }

    #[test]
    fn sanitize_rejects_empty() {
        assert!(sanitize_project_id("").is_err());
    }

    #[test]
    fn sanitize_rejects_all_invalid_chars() {
        assert!(sanitize_project_id("../..").is_err());
    }

    #[test]
    fn safe_join_rejects_absolute_path() {
        let base = Path::new("/data/sites/abc");
        assert!(safe_join(base, "/etc/passwd").is_err());
    }

    #[test]
    fn safe_join_rejects_parent_dir_segments() {
        let base = Path::new("/data/sites/abc");
        assert!(safe_join(base, "../../etc/passwd").is_err());
    }

    #[test]
    fn safe_join_accepts_nested_relative_path() {
        let base = Path::new("/data/sites/abc");
        let joined = safe_join(base, "src/components/Foo.tsx").unwrap();
        assert_eq!(joined, PathBuf::from("/data/sites/abc/src/components/Foo.tsx"));
    }
}
