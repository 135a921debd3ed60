use crate::util::normalize_base_url;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const API_URL_ENV: &str = "FORMATDESK_API_URL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: Api,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub history: History,
    #[serde(default)]
    pub upload: Upload,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg.with_env_overrides())
    }

    /// Defaults plus environment overrides, for runs without a config file.
    pub fn from_env() -> Self {
        Config::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api.base_url = url;
            }
        }
        self.api.base_url = normalize_base_url(&self.api.base_url);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Api {
    pub base_url: String,
    pub connect_timeout_seconds: u64,
    /// Applies to job-list and mirror calls. 0 disables the timeout.
    pub request_timeout_seconds: u64,
    /// Applies to archive submission. 0 disables the timeout.
    pub upload_timeout_seconds: u64,
}
impl Default for Api {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            connect_timeout_seconds: 10,
            request_timeout_seconds: 15,
            upload_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    pub cache_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            cache_dir: ".formatdesk".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub storage_key: String,
    pub max_records: usize,
    /// Copy a successful remote listing into the local cache. Off by default:
    /// the job store renumbers what it is sent.
    pub write_through: bool,
}
impl Default for History {
    fn default() -> Self {
        Self {
            storage_key: "pp.jobs".into(),
            max_records: 50,
            write_through: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub max_bytes: u64,
    pub allowed_extensions: Vec<String>,
    pub default_template: String,
    pub templates: Vec<TemplateChoice>,
    pub options: Vec<String>,
    pub default_options: Vec<String>,
}
impl Default for Upload {
    fn default() -> Self {
        Self {
            max_bytes: 25 * 1024 * 1024,
            allowed_extensions: vec!["zip".into(), "tex".into()],
            default_template: "aastex".into(),
            templates: vec![
                TemplateChoice::new("aastex", "AAS Journals (aastex)"),
                TemplateChoice::new("ieee", "IEEE (IEEEtran)"),
                TemplateChoice::new("elsevier", "Elsevier (elsarticle)"),
            ],
            options: vec!["fix_citations".into(), "ai_grammar".into()],
            default_options: vec!["fix_citations".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateChoice {
    pub value: String,
    pub label: String,
}
impl TemplateChoice {
    fn new(value: &str, label: &str) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
