use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    /// When false the permission gate never prompts and every write fails
    /// instead of being silently allowed.
    #[serde(default = "default_require_confirmation")]
    pub require_confirmation: bool,
    #[serde(default = "default_generation_timeout_sec")]
    pub generation_timeout_sec: u64,
    #[serde(default = "default_allow_shell")]
    pub allow_shell: bool,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            models: ModelsConfig::default(),
            memory_budget_mb: default_memory_budget_mb(),
            workspace_dir: default_workspace_dir(),
            require_confirmation: default_require_confirmation(),
            generation_timeout_sec: default_generation_timeout_sec(),
            allow_shell: default_allow_shell(),
            thresholds: ThresholdsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_router_model")]
    pub router: ModelConfig,
    #[serde(default = "default_coder_model")]
    pub coder: ModelConfig,
    #[serde(default = "default_algorithm_model")]
    pub algorithm: ModelConfig,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            router: default_router_model(),
            coder: default_coder_model(),
            algorithm: default_algorithm_model(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub path: String,
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// 0 means "estimate from file size".
    #[serde(default)]
    pub memory_estimate_mb: u64,
    #[serde(default)]
    pub always_resident: bool,
    /// 0 = never evict on idle.
    #[serde(default)]
    pub idle_evict_after_sec: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_router_model() -> ModelConfig {
    ModelConfig {
        path: "models/router-270m.gguf".to_string(),
        context_size: 2048,
        max_tokens: 256,
        memory_estimate_mb: 400,
        always_resident: true,
        idle_evict_after_sec: 0,
        temperature: 0.1,
    }
}

fn default_coder_model() -> ModelConfig {
    ModelConfig {
        path: "models/coder-7b.gguf".to_string(),
        context_size: 4096,
        max_tokens: 1024,
        memory_estimate_mb: 4800,
        always_resident: false,
        idle_evict_after_sec: 60,
        temperature: 0.3,
    }
}

fn default_algorithm_model() -> ModelConfig {
    ModelConfig {
        path: "models/algorithm-6.7b.gguf".to_string(),
        context_size: 4096,
        max_tokens: 1536,
        memory_estimate_mb: 4500,
        always_resident: false,
        idle_evict_after_sec: 60,
        temperature: 0.2,
    }
}

fn default_context_size() -> u32 {
    2048
}
fn default_max_tokens() -> usize {
    512
}
fn default_temperature() -> f32 {
    0.3
}
fn default_memory_budget_mb() -> u64 {
    6000
}
fn default_workspace_dir() -> String {
    "workspace".to_string()
}
fn default_require_confirmation() -> bool {
    true
}
fn default_generation_timeout_sec() -> u64 {
    300
}
fn default_allow_shell() -> bool {
    true
}

/// Confidence cutoffs for the unknown / clarification bands. The upper
/// bands (0.85 execute-with-preview, 0.95 execute-without-confirmation)
/// are fixed policy, not tunables.
#[derive(Debug, Deserialize, Clone)]
pub struct ThresholdsConfig {
    #[serde(default = "default_unknown_threshold")]
    pub unknown: f32,
    #[serde(default = "default_clarify_threshold")]
    pub clarify: f32,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            unknown: default_unknown_threshold(),
            clarify: default_clarify_threshold(),
        }
    }
}

fn default_unknown_threshold() -> f32 {
    0.50
}
fn default_clarify_threshold() -> f32 {
    0.70
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path`, falling back to built-in defaults when the file
    /// does not exist. A present-but-broken file is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn workspace_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.workspace_dir).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_to_empty_config() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.memory_budget_mb, 6000);
        assert!(config.require_confirmation);
        assert!(config.models.router.always_resident);
        assert!(!config.models.coder.always_resident);
        assert_eq!(config.generation_timeout_sec, 300);
        assert!((config.thresholds.unknown - 0.50).abs() < f32::EPSILON);
        assert!((config.thresholds.clarify - 0.70).abs() < f32::EPSILON);
    }

    #[test]
    fn partial_model_section_keeps_field_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            memory_budget_mb = 12000

            [models.coder]
            path = "models/custom-13b.gguf"
            memory_estimate_mb = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.memory_budget_mb, 12000);
        assert_eq!(config.models.coder.path, "models/custom-13b.gguf");
        assert_eq!(config.models.coder.memory_estimate_mb, 9000);
        // Unspecified fields fall back to per-field defaults.
        assert_eq!(config.models.coder.context_size, 2048);
        // Untouched sections keep role defaults.
        assert_eq!(config.models.router.memory_estimate_mb, 400);
    }

    #[test]
    fn load_or_default_handles_missing_file() {
        let config = AppConfig::load_or_default(Path::new("/nonexistent/codesmith.toml")).unwrap();
        assert_eq!(config.workspace_dir, "workspace");
    }

    #[test]
    fn load_rejects_broken_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "memory_budget_mb = \"not a number\"").unwrap();
        assert!(AppConfig::load(f.path()).is_err());
    }
}
