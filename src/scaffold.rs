//! Scaffolder (component D): a pure function from project configuration to
//! the initial file set of a new project. No I/O — callers (Template
//! Manager, Project Manager) are responsible for writing the returned files.

use serde_json::json;

/// One generated file, relative path + full contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaffoldFile {
    pub path: String,
    pub contents: String,
}

/// Everything the scaffolder needs to know about a project. `base_path` and
/// `hmr_public_url` are precomputed by the caller (they depend on global
/// config — public host/scheme — that the scaffolder itself is agnostic to).
#[derive(Debug, Clone)]
pub struct ScaffoldConfig {
    pub project_id: String,
    pub project_name: String,
    pub description: Option<String>,
    pub jsx_tagger_dep: String,
    pub base_path: String,
    pub hmr_public_url: String,
    pub hmr_path: String,
    pub public_https: bool,
}

impl ScaffoldConfig {
    /// `idPrefix` used by the tagger: the first 8 characters of the project id.
    pub fn id_prefix(&self) -> String {
        self.project_id.chars().take(8).collect()
    }
}

/// Slugify for the package manifest's `name` field: lowercase, runs of
/// non-`[a-z0-9]` collapsed to a single `-`, leading/trailing `-` trimmed.
pub fn slugify(name: &str) -> String {
    let lower = name.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_dash = false;
    for c in lower.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed.to_string()
    }
}

/// HTML-escape a string before interpolating it into a template document.
/// Any attacker-controlled field (project name, description) MUST pass
/// through this before landing in `index.html`.
pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Render `vite.config.ts` from a known-good template string — regenerated
/// wholesale, never patched via regex surgery on an existing file.
/// Shared by the Scaffolder (initial file) and the Template Manager /
/// Instance Supervisor (per-project regeneration, preserving any detected
/// user `resolve.alias` block and extra plugin imports).
pub fn render_vite_config(
    config: &ScaffoldConfig,
    extra_plugin_imports: &[String],
    extra_resolve_alias_block: Option<&str>,
) -> String {
    let hmr_protocol = if config.public_https { "wss" } else { "ws" };
    let id_prefix = config.id_prefix();
    let extra_imports = extra_plugin_imports.join("\n");
    let alias_block = extra_resolve_alias_block.unwrap_or("{}");

    format!(
        r#"import {{ defineConfig }} from "vite";
import react from "@vitejs/plugin-react";
import jsxTagger from "{jsx_tagger_dep}";
{extra_imports}

// Generated by the preview orchestrator. Do not hand-edit — any change here
// is overwritten the next time this project's instance starts.
export default defineConfig({{
  plugins: [jsxTagger({{ idPrefix: "{id_prefix}" }}), react()],
  base: "{base_path}",
  resolve: {{
    alias: {alias_block},
  }},
  server: {{
    host: "0.0.0.0",
    hmr: {{
      protocol: "{hmr_protocol}",
      host: "{hmr_host}",
      clientPort: {client_port},
      path: "{hmr_path}",
    }},
  }},
}});
"#,
        jsx_tagger_dep = config.jsx_tagger_dep,
        extra_imports = extra_imports,
        id_prefix = id_prefix,
        base_path = config.base_path,
        alias_block = alias_block,
        hmr_protocol = hmr_protocol,
        hmr_host = hmr_host_only(&config.hmr_public_url),
        client_port = if config.public_https { 443 } else { 80 },
        hmr_path = config.hmr_path,
    )
}

/// Strip scheme/path from `ws(s)://host/hmr/id` down to just the host.
fn hmr_host_only(hmr_public_url: &str) -> String {
    hmr_public_url
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("localhost")
        .to_string()
}

pub fn scaffold(config: &ScaffoldConfig) -> Vec<ScaffoldFile> {
    let package_name = slugify(&config.project_name);

    let package_json = json!({
        "name": package_name,
        "private": true,
        "version": "0.0.1",
        "type": "module",
        "scripts": {
            "dev": "vite",
            "build": "vite build",
            "preview": "vite preview"
        },
        "dependencies": {
            "react": "^18.3.0",
            "react-dom": "^18.3.0"
        },
        "devDependencies": {
            "@types/react": "^18.3.0",
            "@types/react-dom": "^18.3.0",
            "@vitejs/plugin-react": "^4.3.0",
            "typescript": "^5.5.0",
            "vite": "^5.4.0",
            "jsx-tagger": config.jsx_tagger_dep
        }
    });

    let title = html_escape(&config.project_name);
    let description = config
        .description
        .as_deref()
        .map(html_escape)
        .unwrap_or_default();

    let index_html = format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <meta name="description" content="{description}" />
    <title>{title}</title>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.tsx"></script>
  </body>
</html>
"#
    );

    let index_css = r#"body {
  margin: 0;
  font-family: system-ui, -apple-system, sans-serif;
}
"#
    .to_string();

    let main_tsx = r#"import React from "react";
import ReactDOM from "react-dom/client";
import App from "./App";
import "./index.css";

ReactDOM.createRoot(document.getElementById("root")!).render(
  <React.StrictMode>
    <App />
  </React.StrictMode>,
);
"#
    .to_string();

    let app_tsx = format!(
        r#"export default function App() {{
  return (
    <main>
      <h1>{title}</h1>
    </main>
  );
}}
"#
    );

    let tsconfig_json = json!({
        "compilerOptions": {
            "target": "ES2020",
            "useDefineForClassFields": true,
            "lib": ["ES2020", "DOM", "DOM.Iterable"],
            "module": "ESNext",
            "skipLibCheck": true,
            "moduleResolution": "bundler",
            "allowImportingTsExtensions": true,
            "resolveJsonModule": true,
            "isolatedModules": true,
            "noEmit": true,
            "jsx": "react-jsx",
            "strict": true
        },
        "include": ["src"]
    });

    vec![
        ScaffoldFile {
            path: "package.json".into(),
            contents: serde_json::to_string_pretty(&package_json).unwrap() + "\n",
        },
        ScaffoldFile {
            path: "vite.config.ts".into(),
            contents: render_vite_config(config, &[], None),
        },
        ScaffoldFile {
            path: "tsconfig.json".into(),
            contents: serde_json::to_string_pretty(&tsconfig_json).unwrap() + "\n",
        },
        ScaffoldFile {
            path: "index.html".into(),
            contents: index_html,
        },
        ScaffoldFile {
            path: "src/index.css".into(),
            contents: index_css,
        },
        ScaffoldFile {
            path: "src/main.tsx".into(),
            contents: main_tsx,
        },
        ScaffoldFile {
            path: "src/App.tsx".into(),
            contents: app_tsx,
        },
    ]
}

/// The fixed set of build-critical files `Project Manager::create` must
/// never let user-supplied files overwrite when cloning from the template.
pub const TEMPLATE_SKIP_LIST: &[&str] = &[
    "package.json",
    "vite.config.ts",
    "bun.lockb",
    "bun.lock",
    "package-lock.json",
    "tsconfig.json",
    "tsconfig.node.json",
    "postcss.config.js",
    "tailwind.config.js",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ScaffoldConfig {
        ScaffoldConfig {
            project_id: "abc12345def".to_string(),
            project_name: "My Cool App".to_string(),
            description: Some("<script>alert(1)</script>".to_string()),
            jsx_tagger_dep: "file:/app/packages/vite-plugin-jsx-tagger".to_string(),
            base_path: "/p/abc12345def/".to_string(),
            hmr_public_url: "wss://preview.example.com/hmr/abc12345def".to_string(),
            hmr_path: "/hmr/abc12345def".to_string(),
            public_https: true,
        }
    }

    #[test]
    fn slugify_lowercases_and_dashes() {
        assert_eq!(slugify("My Cool App"), "my-cool-app");
    }

    #[test]
    fn slugify_collapses_runs_of_punctuation() {
        assert_eq!(slugify("Hello!!!World"), "hello-world");
    }

    #[test]
    fn slugify_trims_trailing_dash() {
        assert_eq!(slugify("Trailing---"), "trailing");
    }

    #[test]
    fn slugify_empty_falls_back() {
        assert_eq!(slugify("???"), "project");
    }

    #[test]
    fn html_escape_neutralises_script_tags() {
        let escaped = html_escape("<script>alert(1)</script>");
        assert!(!escaped.contains("<script>"));
        assert!(escaped.contains("&lt;script&gt;"));
    }

    #[test]
    fn scaffold_emits_contract_file_set() {
        let cfg = base_config();
        let files = scaffold(&cfg);
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        for expected in [
            "package.json",
            "vite.config.ts",
            "tsconfig.json",
            "index.html",
            "src/index.css",
            "src/main.tsx",
            "src/App.tsx",
        ] {
            assert!(paths.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn scaffold_escapes_description_in_html() {
        let cfg = base_config();
        let files = scaffold(&cfg);
        let html = &files.iter().find(|f| f.path == "index.html").unwrap().contents;
        assert!(!html.contains("<script>alert"));
    }

    #[test]
    fn scaffold_package_json_has_slugified_name() {
        let cfg = base_config();
        let files = scaffold(&cfg);
        let pkg = &files.iter().find(|f| f.path == "package.json").unwrap().contents;
        assert!(pkg.contains("\"my-cool-app\""));
    }

    #[test]
    fn vite_config_sets_correct_base_and_wss() {
        let cfg = base_config();
        let files = scaffold(&cfg);
        let vite = &files.iter().find(|f| f.path == "vite.config.ts").unwrap().contents;
        assert!(vite.contains("base: \"/p/abc12345def/\""));
        assert!(vite.contains("protocol: \"wss\""));
        assert!(vite.contains("idPrefix: \"abc12345\""));
    }

    #[test]
    fn vite_config_plain_ws_when_not_https() {
        let mut cfg = base_config();
        cfg.public_https = false;
        cfg.hmr_public_url = "ws://preview.example.com/hmr/abc12345def".to_string();
        let vite = render_vite_config(&cfg, &[], None);
        assert!(vite.contains("protocol: \"ws\""));
    }

    #[test]
    fn id_prefix_is_first_eight_chars() {
        let cfg = base_config();
        assert_eq!(cfg.id_prefix(), "abc12345");
    }

    #[test]
    fn skip_list_contains_package_json_and_lockfiles() {
        assert!(TEMPLATE_SKIP_LIST.contains(&"package.json"));
        assert!(TEMPLATE_SKIP_LIST.contains(&"vite.config.ts"));
    }
}
