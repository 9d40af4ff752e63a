use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Config;
use crate::orchestrator::PagePolicy;

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub llm: Option<LlmConfig>,
    pub processing: Option<ProcessingConfig>,
    pub storage: Option<StorageConfig>,
    pub search: Option<SearchConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub ollama_url: Option<String>,
    pub model: Option<String>,
    pub num_ctx: Option<u32>,
    pub keep_alive: Option<i64>,
    pub timeout_secs: Option<u64>,
    pub autostart: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub max_pages: Option<usize>,
    pub pages_per_request: Option<usize>,
    pub page_policy: Option<PagePolicy>,
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub render_zoom: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    pub max_results: Option<usize>,
    pub download_dir: Option<String>,
    /// arXiv Atom API endpoint, for mirrors.
    pub api_url: Option<String>,
}

/// Platform config directory path: `<config_dir>/synthex/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("synthex").join("config.toml"))
}

/// Load config by cascading CWD `.synthex.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".synthex.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            None
        }
    }
}

/// First value present in `overlay`, else in `base`.
fn pick<S, T>(overlay: Option<&S>, base: Option<&S>, get: impl Fn(&S) -> Option<T>) -> Option<T> {
    overlay.and_then(&get).or_else(|| base.and_then(&get))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (bl, ol) = (base.llm.as_ref(), overlay.llm.as_ref());
    let (bp, op) = (base.processing.as_ref(), overlay.processing.as_ref());
    let (bs, os) = (base.storage.as_ref(), overlay.storage.as_ref());
    let (bq, oq) = (base.search.as_ref(), overlay.search.as_ref());

    ConfigFile {
        llm: Some(LlmConfig {
            ollama_url: pick(ol, bl, |l| l.ollama_url.clone()),
            model: pick(ol, bl, |l| l.model.clone()),
            num_ctx: pick(ol, bl, |l| l.num_ctx),
            keep_alive: pick(ol, bl, |l| l.keep_alive),
            timeout_secs: pick(ol, bl, |l| l.timeout_secs),
            autostart: pick(ol, bl, |l| l.autostart),
        }),
        processing: Some(ProcessingConfig {
            max_pages: pick(op, bp, |p| p.max_pages),
            pages_per_request: pick(op, bp, |p| p.pages_per_request),
            page_policy: pick(op, bp, |p| p.page_policy),
            max_retries: pick(op, bp, |p| p.max_retries),
            retry_delay_secs: pick(op, bp, |p| p.retry_delay_secs),
            render_zoom: pick(op, bp, |p| p.render_zoom),
        }),
        storage: Some(StorageConfig {
            db_path: pick(os, bs, |s| s.db_path.clone()),
        }),
        search: Some(SearchConfig {
            max_results: pick(oq, bq, |s| s.max_results),
            download_dir: pick(oq, bq, |s| s.download_dir.clone()),
            api_url: pick(oq, bq, |s| s.api_url.clone()),
        }),
    }
}

impl ConfigFile {
    /// Overwrite the fields of `config` that this file sets.
    pub fn apply(&self, config: &mut Config) {
        if let Some(llm) = &self.llm {
            if let Some(url) = &llm.ollama_url {
                config.ollama_url = url.clone();
            }
            if let Some(model) = &llm.model {
                config.model = model.clone();
            }
            if let Some(num_ctx) = llm.num_ctx {
                config.num_ctx = num_ctx;
            }
            if let Some(keep_alive) = llm.keep_alive {
                config.keep_alive = keep_alive;
            }
            if let Some(secs) = llm.timeout_secs {
                config.inference_timeout_secs = secs;
            }
            if let Some(autostart) = llm.autostart {
                config.autostart_server = autostart;
            }
        }
        if let Some(processing) = &self.processing {
            if let Some(max_pages) = processing.max_pages {
                config.max_pages = max_pages;
            }
            if let Some(n) = processing.pages_per_request {
                config.pages_per_request = n.max(1);
            }
            if let Some(policy) = processing.page_policy {
                config.page_policy = policy;
            }
            if let Some(retries) = processing.max_retries {
                config.max_retries = retries;
            }
            if let Some(secs) = processing.retry_delay_secs {
                config.retry_delay_secs = secs;
            }
            if let Some(zoom) = processing.render_zoom {
                config.render_zoom = zoom;
            }
        }
        if let Some(path) = self.storage.as_ref().and_then(|s| s.db_path.as_ref()) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(search) = &self.search {
            if let Some(max) = search.max_results {
                config.max_results = max;
            }
            if let Some(dir) = &search.download_dir {
                config.download_dir = PathBuf::from(dir);
            }
            if let Some(url) = &search.api_url {
                config.arxiv_api_url = url.clone();
            }
        }
    }
}
