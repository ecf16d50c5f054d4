//! Application configuration: pool, budgets, providers, pipeline, health,
//! and per-environment database credentials (§6 Configuration).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::FatalStartupError;

/// Per-class CPU/RAM cost used by the Capacity Budget (§4.2).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClassCost {
    pub cpu: u32,
    pub ram: u32,
}

/// Pool Manager configuration (§4.3).
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub pool_size: u32,
    pub min_index_workers: u32,
    pub min_acte_workers: u32,
    pub rebalance_interval_ms: u64,
    pub rebalance_threshold: u32,
    pub poll_interval_ms: u64,
    pub idle_close_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 6,
            min_index_workers: 2,
            min_acte_workers: 2,
            rebalance_interval_ms: 60_000,
            rebalance_threshold: 10,
            poll_interval_ms: 2_000,
            idle_close_ms: 300_000,
        }
    }
}

/// Capacity Budget configuration (§4.2).
#[derive(Debug, Clone, Deserialize)]
pub struct CapacityConfig {
    pub server_max_cpu: u32,
    pub server_max_ram: u32,
    pub server_reserve_cpu_percent: u32,
    pub server_reserve_ram_percent: u32,
    pub class_costs: HashMap<String, ClassCost>,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        let mut class_costs = HashMap::new();
        class_costs.insert("registre".to_string(), ClassCost { cpu: 3, ram: 1 });
        class_costs.insert("index-ocr".to_string(), ClassCost { cpu: 1, ram: 1 });
        class_costs.insert("acte-ocr".to_string(), ClassCost { cpu: 2, ram: 2 });
        Self {
            server_max_cpu: 16,
            server_max_ram: 32,
            server_reserve_cpu_percent: 10,
            server_reserve_ram_percent: 10,
            class_costs,
        }
    }
}

/// Rate Budget configuration (§4.1), per provider.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub rpm_max: u32,
    pub tpm_max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { rpm_max: 60, tpm_max: 1_000_000 }
    }
}

/// Per-provider max-output-token table, keyed on exact model name.
///
/// The spec's open question on this table says to reject unknown model
/// names at config-load time rather than default them; `TokenLimits::lookup`
/// below does that.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenLimits {
    pub max_output_tokens: u32,
}

/// A single LLM provider's credentials and call options (§4.4, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model_name: String,
    pub temperature: f32,
    pub base_url: String,
    pub token_limits: HashMap<String, TokenLimits>,
    pub supports_file_api: bool,
}

impl ProviderConfig {
    /// Look up the max-output-tokens budget for this provider's configured
    /// model. An unknown model name is a fatal config error, not a default.
    pub fn max_output_tokens(&self) -> Result<u32, FatalStartupError> {
        self.token_limits
            .get(&self.model_name)
            .map(|t| t.max_output_tokens)
            .ok_or_else(|| {
                FatalStartupError::Config(format!(
                    "no token-limit entry for model '{}'; refusing to default",
                    self.model_name
                ))
            })
    }
}

/// Pipeline-wide knobs (§6 Pipeline).
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub pdf_dpi: u32,
    pub provider_timeout_secs: u64,
    pub continuation_retry_budget: u32,
    pub extraction_attempt_budget: u32,
    pub boost_attempt_budget: u32,
    pub file_api_readiness_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pdf_dpi: 300,
            provider_timeout_secs: 60,
            continuation_retry_budget: 3,
            extraction_attempt_budget: 3,
            boost_attempt_budget: 3,
            file_api_readiness_timeout_secs: 60,
        }
    }
}

/// Prompt text handed to the provider clients for each pipeline stage (§4.6,
/// §4.7). Kept in config rather than hardcoded so operators can tune wording
/// without a rebuild.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptsConfig {
    pub index_extract: String,
    pub index_extract_continuation: String,
    pub index_boost: String,
    pub index_boost_continuation: String,
    pub acte_extract: String,
    pub acte_extract_continuation: String,
    pub acte_boost: String,
    pub acte_boost_continuation: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            index_extract: "Transcribe every inscription on this index page of a Quebec land \
                registry (circonscription foncière, cadastre, lot number, and each Ligne N: \
                entry with its publication date, publication number, nature, parties, and \
                remarks) into plain text. End your response with EXTRACTION_COMPLETE: once the \
                page is fully transcribed."
                .to_string(),
            index_extract_continuation: "Continue the transcription of this index page from \
                exactly where the previous response left off; do not repeat lines already \
                transcribed. End with EXTRACTION_COMPLETE: once done."
                .to_string(),
            index_boost: "Clean up the following raw OCR transcription of a Quebec land registry \
                index: fix obvious character-recognition errors, normalize dates and publication \
                numbers, and preserve every inscription. End with BOOST_COMPLETE: once done."
                .to_string(),
            index_boost_continuation: "Continue cleaning up the transcription from exactly where \
                the previous response left off. End with BOOST_COMPLETE: once done."
                .to_string(),
            acte_extract: "Transcribe this entire acte (deed) document verbatim into plain text, \
                preserving its structure. End your response with EXTRACTION_COMPLETE: once the \
                whole document is transcribed."
                .to_string(),
            acte_extract_continuation: "Continue the transcription of this acte from exactly \
                where the previous response left off; do not repeat text already transcribed. \
                End with EXTRACTION_COMPLETE: once done."
                .to_string(),
            acte_boost: "Clean up the following raw OCR transcription of an acte: fix obvious \
                character-recognition errors while preserving the document's full content and \
                structure. End with BOOST_COMPLETE: once done."
                .to_string(),
            acte_boost_continuation: "Continue cleaning up the transcription from exactly where \
                the previous response left off. End with BOOST_COMPLETE: once done."
                .to_string(),
        }
    }
}

/// Health Monitor configuration (§4.10).
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    pub stale_check_interval_ms: u64,
    pub stale_job_threshold_ms: u64,
    pub dead_worker_threshold_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_check_interval_ms: 30_000,
            stale_job_threshold_ms: 180_000,
            dead_worker_threshold_ms: 120_000,
        }
    }
}

/// A single logical environment's database credentials (§6, §9 open question
/// on multi-environment polling: resolved as simple round-robin).
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub database_url: Option<String>,
}

/// Top-level application settings, the way `config/settings.rs` lays out a
/// plain struct with a `Default` impl and env/file overrides layered on top.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub database_filename: String,
    pub environments: Vec<EnvironmentConfig>,
    pub rate_limit_backend: Option<String>,
    /// Base URL of the HTTP object-storage gateway fronting the `index`,
    /// `actes`, and `plans-cadastraux` buckets (§6). `None` falls back to
    /// reading PDFs from the local filesystem under `data_dir`, for dev and
    /// single-machine deployments.
    pub object_storage_base_url: Option<String>,
    pub max_attempts: u32,
    pub pool: PoolConfig,
    pub capacity: CapacityConfig,
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub providers: HashMap<String, ProviderConfig>,
    pub provider_order: Vec<String>,
    pub pipeline: PipelineConfig,
    pub health: HealthConfig,
    pub prompts: PromptsConfig,
}

/// On-disk/TOML representation; every field optional so the file only needs
/// to carry overrides. Mirrors `config/settings.rs`'s layering model.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsFile {
    pub data_dir: Option<PathBuf>,
    pub database_filename: Option<String>,
    pub environments: Option<Vec<EnvironmentConfig>>,
    pub rate_limit_backend: Option<String>,
    pub object_storage_base_url: Option<String>,
    pub max_attempts: Option<u32>,
    pub pool: Option<PoolConfig>,
    pub capacity: Option<CapacityConfig>,
    pub rate_limits: Option<HashMap<String, RateLimitConfig>>,
    pub providers: Option<HashMap<String, ProviderConfig>>,
    pub provider_order: Option<Vec<String>>,
    pub pipeline: Option<PipelineConfig>,
    pub health: Option<HealthConfig>,
    pub prompts: Option<PromptsConfig>,
}

const DEFAULT_DATABASE_FILENAME: &str = "registre-ocr-pool.sqlite3";

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("registre-ocr-pool");

        Self {
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            environments: Vec::new(),
            rate_limit_backend: None,
            object_storage_base_url: None,
            max_attempts: 3,
            pool: PoolConfig::default(),
            capacity: CapacityConfig::default(),
            rate_limits: HashMap::new(),
            providers: HashMap::new(),
            provider_order: vec!["primary".to_string(), "fallback".to_string()],
            pipeline: PipelineConfig::default(),
            health: HealthConfig::default(),
            prompts: PromptsConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings: defaults, overlaid by an optional TOML file, overlaid
    /// by a handful of environment variables for secrets.
    pub fn load(toml_path: Option<&std::path::Path>) -> Result<Self, FatalStartupError> {
        let mut settings = Settings::default();

        if let Some(path) = toml_path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| FatalStartupError::Config(format!("reading {}: {}", path.display(), e)))?;
            let file: SettingsFile = toml::from_str(&text)
                .map_err(|e| FatalStartupError::Config(format!("parsing {}: {}", path.display(), e)))?;
            settings.apply(file);
        }

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply(&mut self, file: SettingsFile) {
        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = file.database_filename {
            self.database_filename = v;
        }
        if let Some(v) = file.environments {
            self.environments = v;
        }
        if let Some(v) = file.rate_limit_backend {
            self.rate_limit_backend = Some(v);
        }
        if let Some(v) = file.object_storage_base_url {
            self.object_storage_base_url = Some(v);
        }
        if let Some(v) = file.max_attempts {
            self.max_attempts = v;
        }
        if let Some(v) = file.pool {
            self.pool = v;
        }
        if let Some(v) = file.capacity {
            self.capacity = v;
        }
        if let Some(v) = file.rate_limits {
            self.rate_limits = v;
        }
        if let Some(v) = file.providers {
            self.providers = v;
        }
        if let Some(v) = file.provider_order {
            self.provider_order = v;
        }
        if let Some(v) = file.pipeline {
            self.pipeline = v;
        }
        if let Some(v) = file.health {
            self.health = v;
        }
        if let Some(v) = file.prompts {
            self.prompts = v;
        }
    }

    /// Environment-variable overrides for secrets, per `config/settings.rs`'s
    /// DATABASE_URL convention.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.rate_limit_backend = Some(url);
        }
        if let Ok(url) = std::env::var("OBJECT_STORAGE_URL") {
            self.object_storage_base_url = Some(url);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if self.environments.is_empty() {
                self.environments.push(EnvironmentConfig {
                    name: "default".to_string(),
                    database_url: Some(url),
                });
            }
        }
        for (name, provider) in self.providers.iter_mut() {
            let env_key = format!("{}_API_KEY", name.to_uppercase());
            if let Ok(key) = std::env::var(&env_key) {
                provider.api_key = key;
            }
        }
    }

    fn validate(&self) -> Result<(), FatalStartupError> {
        if self.pool.min_index_workers + self.pool.min_acte_workers > self.pool.pool_size {
            return Err(FatalStartupError::Config(
                "min_index_workers + min_acte_workers exceeds pool_size".to_string(),
            ));
        }
        for provider in self.providers.values() {
            provider.max_output_tokens()?;
        }
        Ok(())
    }

    /// Database URL for a given environment, falling back to a local sqlite
    /// file under `data_dir` the way `config/settings.rs::database_url` does.
    pub fn database_url(&self, env: &EnvironmentConfig) -> String {
        if let Some(ref url) = env.database_url {
            url.clone()
        } else {
            let path = self.data_dir.join(&self.database_filename);
            format!("sqlite:{}", path.display())
        }
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn pool_minima_exceeding_size_is_rejected() {
        let mut settings = Settings::default();
        settings.pool.pool_size = 2;
        settings.pool.min_index_workers = 2;
        settings.pool.min_acte_workers = 2;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn unknown_model_name_is_rejected() {
        let mut settings = Settings::default();
        settings.providers.insert(
            "primary".to_string(),
            ProviderConfig {
                api_key: "x".to_string(),
                model_name: "unlisted-model".to_string(),
                temperature: 0.0,
                base_url: "https://example.invalid".to_string(),
                token_limits: HashMap::new(),
                supports_file_api: false,
            },
        );
        assert!(settings.validate().is_err());
    }

    #[test]
    fn database_url_falls_back_to_data_dir() {
        let settings = Settings::default();
        let env = EnvironmentConfig { name: "dev".to_string(), database_url: None };
        assert!(settings.database_url(&env).starts_with("sqlite:"));
    }
}
