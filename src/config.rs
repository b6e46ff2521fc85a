//! Single process-wide configuration (component L). Every environment
//! variable this process reads is read exactly once, here; no other module
//! calls `std::env::var` directly.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Public listen port (env: PORT)
    pub port: u16,

    /// Root directory for per-project directories (env: DATA_DIR)
    pub data_dir: PathBuf,

    /// HMAC credentials. Empty ⇒ unauthenticated development mode.
    pub api_key: String,
    pub api_secret: String,

    /// Public hostname injected into the child's HMR config (env: FLY_PUBLIC_HOST)
    pub public_host: String,

    /// Force wss/443 in the child's HMR config (env: FLY_HTTPS)
    pub public_https: bool,

    /// Package-manager / runner binary (env: BUN_BINARY)
    pub bun_binary: String,

    /// Dependency specifier for the tagger transform placed in generated manifests
    /// (env: JSX_TAGGER_DEP)
    pub jsx_tagger_dep: String,

    /// Optional build-time pre-warmed template directory (env: PREBUILT_TEMPLATE_DIR)
    pub prebuilt_template_dir: Option<PathBuf>,

    /// First port of the instance pool (env: BASE_PORT)
    pub base_port: u16,

    /// Size of the instance pool (env: MAX_INSTANCES)
    pub max_instances: u16,

    /// Idle eviction threshold, seconds (env: IDLE_TIMEOUT_SECS)
    pub idle_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "/data/sites".into())
                .into(),
            api_key: std::env::var("FLY_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("FLY_API_SECRET").unwrap_or_default(),
            public_host: std::env::var("FLY_PUBLIC_HOST")
                .unwrap_or_else(|_| "omniflow-preview.fly.dev".into()),
            public_https: std::env::var("FLY_HTTPS")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or_else(|_| {
                    std::env::var("FLY_PUBLIC_HOST")
                        .map(|h| h.ends_with(".fly.dev"))
                        .unwrap_or(false)
                }),
            bun_binary: std::env::var("BUN_BINARY").unwrap_or_else(|_| "bun".into()),
            jsx_tagger_dep: std::env::var("JSX_TAGGER_DEP")
                .unwrap_or_else(|_| "file:/app/packages/vite-plugin-jsx-tagger".into()),
            prebuilt_template_dir: std::env::var("PREBUILT_TEMPLATE_DIR").ok().map(Into::into),
            base_port: std::env::var("BASE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5200),
            max_instances: std::env::var("MAX_INSTANCES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            idle_timeout_secs: std::env::var("IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1800),
        })
    }

    /// True when both HMAC credentials are configured. When false the control
    /// plane runs in unauthenticated development mode (logged once at startup).
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    /// `[base_port, base_port + max_instances)`.
    pub fn port_range(&self) -> std::ops::Range<u16> {
        self.base_port..(self.base_port + self.max_instances)
    }

    /// Path for a sanitised project id under the data root. Does not perform
    /// sanitisation itself — callers go through `project::sanitize_project_id`
    /// first; this just joins.
    pub fn project_dir(&self, sanitized_id: &str) -> PathBuf {
        self.data_dir.join(sanitized_id)
    }

    /// The managed template directory, `<DATA_DIR>/_template`.
    pub fn template_dir(&self) -> PathBuf {
        self.data_dir.join("_template")
    }

    /// The public HMR WebSocket URL the child's `vite.config.ts` should
    /// advertise to browsers.
    pub fn hmr_public_url(&self, project_id: &str) -> String {
        let scheme = if self.public_https { "wss" } else { "ws" };
        format!(
            "{scheme}://{}/hmr/{}",
            self.public_host.trim_end_matches('/'),
            project_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal `AppConfig` with all fields defaulted. Override
    /// specific fields in each test via struct update syntax.
    fn base_config() -> AppConfig {
        AppConfig {
            port: 3000,
            data_dir: "/data/sites".into(),
            api_key: String::new(),
            api_secret: String::new(),
            public_host: "omniflow-preview.fly.dev".into(),
            public_https: false,
            bun_binary: "bun".into(),
            jsx_tagger_dep: "file:/app/packages/vite-plugin-jsx-tagger".into(),
            prebuilt_template_dir: None,
            base_port: 5200,
            max_instances: 20,
            idle_timeout_secs: 1800,
        }
    }

    #[test]
    fn has_credentials_both_present() {
        let cfg = AppConfig {
            api_key: "k".into(),
            api_secret: "s".into(),
            ..base_config()
        };
        assert!(cfg.has_credentials());
    }

    #[test]
    fn has_credentials_missing_one_is_dev_mode() {
        let cfg = AppConfig {
            api_key: "k".into(),
            api_secret: String::new(),
            ..base_config()
        };
        assert!(!cfg.has_credentials());
    }

    #[test]
    fn has_credentials_neither_is_dev_mode() {
        assert!(!base_config().has_credentials());
    }

    #[test]
    fn port_range_uses_configured_defaults() {
        let cfg = base_config();
        let range = cfg.port_range();
        assert_eq!(range.start, 5200);
        assert_eq!(range.end, 5220);
        assert_eq!(range.count(), 20);
    }

    #[test]
    fn project_dir_joins_under_data_root() {
        let cfg = base_config();
        assert_eq!(cfg.project_dir("abc123"), PathBuf::from("/data/sites/abc123"));
    }

    #[test]
    fn template_dir_is_underscore_template() {
        let cfg = base_config();
        assert_eq!(cfg.template_dir(), PathBuf::from("/data/sites/_template"));
    }

    #[test]
    fn hmr_public_url_plain_ws() {
        let cfg = AppConfig {
            public_host: "preview.example.com".into(),
            public_https: false,
            ..base_config()
        };
        assert_eq!(
            cfg.hmr_public_url("p1"),
            "ws://preview.example.com/hmr/p1"
        );
    }

    #[test]
    fn hmr_public_url_secure_wss() {
        let cfg = AppConfig {
            public_host: "preview.example.com".into(),
            public_https: true,
            ..base_config()
        };
        assert_eq!(
            cfg.hmr_public_url("p1"),
            "wss://preview.example.com/hmr/p1"
        );
    }
}
