//! Configuration for the orchestration server
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/parley/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::llm::ProviderSettings;

#[cfg(test)]
mod tests;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP server to
    pub bind_addr: SocketAddr,

    /// MongoDB connection string; None runs on the in-memory store
    pub mongodb_uri: Option<String>,

    /// Allowed CORS origins; empty means any origin
    pub cors_origins: Vec<String>,

    /// Treat every config as requireAuth
    pub force_auth: bool,

    /// LLM provider credentials and endpoints
    pub providers: ProviderSettings,

    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static bind addr"),
            mongodb_uri: None,
            cors_origins: Vec::new(),
            force_auth: false,
            providers: ProviderSettings {
                anthropic_api_key: None,
                openai_api_key: None,
                anthropic_base_url: DEFAULT_ANTHROPIC_URL.to_string(),
                openai_base_url: DEFAULT_OPENAI_URL.to_string(),
            },
            log_level: "info".to_string(),
        }
    }
}

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub mongodb_uri: Option<String>,
    pub cors_origins: Option<Vec<String>>,
    pub force_auth: Option<bool>,
    pub log_level: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub openai_base_url: Option<String>,
}

impl Config {
    /// Get the config file path: ~/.config/parley/config.toml
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("parley").join("config.toml"))
    }

    /// Load file config if it exists
    ///
    /// A config file that exists but cannot be parsed is fatal: failing fast
    /// with the parse error beats silently running on defaults.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to parse {}: {e}", path.display());
                    eprintln!("Fix or delete the file and restart.");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("Cannot read {}: {e}", path.display());
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars -> file -> defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        Self::resolve(file)
    }

    fn resolve(file: FileConfig) -> Self {
        let defaults = Self::default();

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.port)
            .unwrap_or_else(|| defaults.bind_addr.port());
        let host = std::env::var("HOST")
            .ok()
            .or(file.host)
            .unwrap_or_else(|| defaults.bind_addr.ip().to_string());
        let bind_addr = format!("{host}:{port}")
            .parse()
            .expect("Invalid bind address");

        let mongodb_uri = std::env::var("MONGODB_URI").ok().or(file.mongodb_uri);

        // CORS_ORIGINS is comma-separated; an empty/absent value allows any
        // origin (the fronting deployment is expected to pin this down).
        let cors_origins = std::env::var("CORS_ORIGINS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .or(file.cors_origins)
            .unwrap_or_default();

        let force_auth = std::env::var("FORCE_AUTH")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .ok()
            .or(file.force_auth)
            .unwrap_or(false);

        let log_level = std::env::var("PARLEY_LOG")
            .ok()
            .or(file.log_level)
            .unwrap_or(defaults.log_level);

        let providers = ProviderSettings {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            anthropic_base_url: std::env::var("ANTHROPIC_BASE_URL")
                .ok()
                .or(file.anthropic_base_url)
                .unwrap_or(defaults.providers.anthropic_base_url),
            openai_base_url: std::env::var("OPENAI_BASE_URL")
                .ok()
                .or(file.openai_base_url)
                .unwrap_or(defaults.providers.openai_base_url),
        };

        Self {
            bind_addr,
            mongodb_uri,
            cors_origins,
            force_auth,
            providers,
            log_level,
        }
    }

    /// Effective configuration for `config --show`, with secrets masked.
    pub fn display(&self) -> String {
        let mask = |key: &Option<String>| match key {
            Some(_) => "set",
            None => "unset",
        };
        format!(
            "bind_addr = {}\n\
             mongodb_uri = {}\n\
             cors_origins = {:?}\n\
             force_auth = {}\n\
             log_level = {}\n\
             anthropic_api_key = {}\n\
             openai_api_key = {}\n\
             anthropic_base_url = {}\n\
             openai_base_url = {}",
            self.bind_addr,
            self.mongodb_uri.as_deref().unwrap_or("(in-memory store)"),
            self.cors_origins,
            self.force_auth,
            self.log_level,
            mask(&self.providers.anthropic_api_key),
            mask(&self.providers.openai_api_key),
            self.providers.anthropic_base_url,
            self.providers.openai_base_url,
        )
    }
}
