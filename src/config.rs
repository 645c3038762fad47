//! Configuration loading and defaults for llmsh.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::template::{ChatTemplate, DEFAULT_TEMPLATE};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_CONTEXT_WINDOW: u64 = 10 * 1024;
pub const DEFAULT_RENDER_CAPACITY: usize = 10 * 1024;
pub const DEFAULT_MAX_INPUT_BYTES: usize = 10 * 1024;
pub const DEFAULT_MAX_RESULT_BYTES: usize = 10 * 1024;
pub const DEFAULT_INPUT_TERMINATOR: u8 = crate::input::CTRL_Z;
pub const DEFAULT_SYSTEM_PROMPT_PATH: &str = "prompts/system.md";

// === Types ===

/// Raw retry configuration loaded from config files.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub exponential_base: Option<f64>,
}

/// Resolved retry policy with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: 0.5,
            max_delay: 10.0,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay for a retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay * self.exponential_base.powi(exponent);
        let delay = delay.min(self.max_delay);
        // Misconfigured values can produce NaN or negatives.
        let delay = if delay.is_nan() { 0.0 } else { delay.clamp(0.0, 300.0) };
        std::time::Duration::from_secs_f64(delay)
    }
}

/// Raw sampling configuration loaded from config files.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SamplingConfig {
    pub temperature: Option<f32>,
    pub min_p: Option<f32>,
    pub seed: Option<u32>,
    pub n_predict: Option<i32>,
}

/// Resolved sampling parameters sent with every completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub min_p: f32,
    pub seed: Option<u32>,
    /// Maximum tokens per reply; `-1` lets the model run to end of turn.
    pub n_predict: i32,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            min_p: 0.05,
            seed: None,
            n_predict: -1,
        }
    }
}

/// Resolved CLI configuration, including defaults and environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub base_url: Option<String>,
    pub template: Option<String>,
    pub system_prompt_path: Option<String>,
    pub context_window: Option<u64>,
    pub render_capacity: Option<usize>,
    pub max_input_bytes: Option<usize>,
    pub max_result_bytes: Option<usize>,
    pub input_terminator: Option<u32>,
    /// Interpreter override, e.g. `["bash", "-c"]`.
    pub shell: Option<Vec<String>>,
    pub sampling: Option<SamplingConfig>,
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(flatten)]
    base: Config,
    profiles: Option<HashMap<String, Config>>,
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load(path: Option<PathBuf>, profile: Option<&str>) -> Result<Self> {
        let path = resolve_load_config_path(path);
        let mut config = match path.as_ref() {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                let parsed: ConfigFile = toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
                apply_profile(parsed, profile)?
            }
            _ if profile.is_some() => {
                anyhow::bail!(
                    "Profile '{}' requested but no config file was found",
                    profile.unwrap_or_default()
                );
            }
            _ => Config::default(),
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Validate that configured values are usable.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = self.base_url.as_deref()
            && url.trim().is_empty()
        {
            anyhow::bail!("base_url cannot be empty");
        }
        if let Some(name) = self.template.as_deref() {
            name.parse::<ChatTemplate>()
                .map_err(|err| anyhow::anyhow!("Invalid template: {err}"))?;
        }
        for (key, value) in [
            ("render_capacity", self.render_capacity),
            ("max_input_bytes", self.max_input_bytes),
            ("max_result_bytes", self.max_result_bytes),
        ] {
            if value == Some(0) {
                anyhow::bail!("{key} must be greater than zero");
            }
        }
        if self.context_window == Some(0) {
            anyhow::bail!("context_window must be greater than zero");
        }
        if let Some(code) = self.input_terminator
            && (code == 0 || code > 0x7f || code == u32::from(b'\n'))
        {
            anyhow::bail!(
                "Invalid input_terminator {code}: expected an ASCII control code other than newline (26 is Ctrl+Z)"
            );
        }
        if let Some(shell) = &self.shell
            && shell.first().is_none_or(|program| program.trim().is_empty())
        {
            anyhow::bail!("shell must name an interpreter program, e.g. [\"sh\", \"-c\"]");
        }
        Ok(())
    }

    /// Return the completion server base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim()
            .trim_end_matches('/')
            .to_string()
    }

    #[must_use]
    pub fn template(&self) -> ChatTemplate {
        self.template
            .as_deref()
            .and_then(|name| name.parse().ok())
            .unwrap_or(DEFAULT_TEMPLATE)
    }

    /// Explicitly configured system prompt path, if any.
    #[must_use]
    pub fn system_prompt_path(&self) -> Option<PathBuf> {
        self.system_prompt_path.as_deref().map(expand_path)
    }

    #[must_use]
    pub fn context_window(&self) -> u64 {
        self.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }

    #[must_use]
    pub fn render_capacity(&self) -> usize {
        self.render_capacity.unwrap_or(DEFAULT_RENDER_CAPACITY)
    }

    #[must_use]
    pub fn max_input_bytes(&self) -> usize {
        self.max_input_bytes.unwrap_or(DEFAULT_MAX_INPUT_BYTES)
    }

    #[must_use]
    pub fn max_result_bytes(&self) -> usize {
        self.max_result_bytes.unwrap_or(DEFAULT_MAX_RESULT_BYTES)
    }

    #[must_use]
    pub fn input_terminator(&self) -> u8 {
        self.input_terminator
            .and_then(|code| u8::try_from(code).ok())
            .unwrap_or(DEFAULT_INPUT_TERMINATOR)
    }

    /// Interpreter program and leading arguments, when overridden.
    #[must_use]
    pub fn shell(&self) -> Option<(String, Vec<String>)> {
        let shell = self.shell.as_ref()?;
        let (program, args) = shell.split_first()?;
        Some((program.clone(), args.to_vec()))
    }

    /// Resolve sampling parameters with defaults applied.
    #[must_use]
    pub fn sampling(&self) -> Sampling {
        let defaults = Sampling::default();
        let Some(cfg) = &self.sampling else {
            return defaults;
        };
        Sampling {
            temperature: cfg.temperature.unwrap_or(defaults.temperature),
            min_p: cfg.min_p.unwrap_or(defaults.min_p),
            seed: cfg.seed.or(defaults.seed),
            n_predict: cfg.n_predict.unwrap_or(defaults.n_predict),
        }
    }

    /// Resolve the effective retry policy with defaults applied.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let Some(cfg) = &self.retry else {
            return defaults;
        };
        RetryPolicy {
            enabled: cfg.enabled.unwrap_or(defaults.enabled),
            max_retries: cfg.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: cfg.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: cfg.max_delay.unwrap_or(defaults.max_delay),
            exponential_base: cfg.exponential_base.unwrap_or(defaults.exponential_base),
        }
    }
}

// === Defaults ===

/// Config file location used when none is given on the command line.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    env_config_path().or_else(home_config_path)
}

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".llmsh").join("config.toml"))
}

fn env_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("LLMSH_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(expand_path(trimmed));
        }
    }
    None
}

fn resolve_load_config_path(path: Option<PathBuf>) -> Option<PathBuf> {
    match path {
        Some(path) => Some(path.to_str().map_or(path.clone(), expand_path)),
        None => default_config_path(),
    }
}

fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

// === Environment Overrides ===

fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("LLMSH_BASE_URL") {
        config.base_url = Some(value);
    }
    if let Some(value) = lookup("LLMSH_TEMPLATE") {
        config.template = Some(value);
    }
    if let Some(value) = lookup("LLMSH_SYSTEM_PROMPT") {
        config.system_prompt_path = Some(value);
    }
    if let Some(value) = lookup("LLMSH_CONTEXT_WINDOW")
        && let Ok(parsed) = value.trim().parse::<u64>()
    {
        config.context_window = Some(parsed);
    }
}

fn apply_profile(config: ConfigFile, profile: Option<&str>) -> Result<Config> {
    let Some(profile_name) = profile else {
        return Ok(config.base);
    };
    let profiles = config.profiles.as_ref();
    match profiles.and_then(|profiles| profiles.get(profile_name)) {
        Some(override_cfg) => Ok(merge_config(config.base, override_cfg.clone())),
        None => {
            let available = profiles
                .map(|profiles| {
                    let mut keys = profiles.keys().cloned().collect::<Vec<_>>();
                    keys.sort();
                    if keys.is_empty() {
                        "none".to_string()
                    } else {
                        keys.join(", ")
                    }
                })
                .unwrap_or_else(|| "none".to_string());
            anyhow::bail!("Profile '{profile_name}' not found. Available profiles: {available}")
        }
    }
}

fn merge_config(base: Config, override_cfg: Config) -> Config {
    Config {
        base_url: override_cfg.base_url.or(base.base_url),
        template: override_cfg.template.or(base.template),
        system_prompt_path: override_cfg.system_prompt_path.or(base.system_prompt_path),
        context_window: override_cfg.context_window.or(base.context_window),
        render_capacity: override_cfg.render_capacity.or(base.render_capacity),
        max_input_bytes: override_cfg.max_input_bytes.or(base.max_input_bytes),
        max_result_bytes: override_cfg.max_result_bytes.or(base.max_result_bytes),
        input_terminator: override_cfg.input_terminator.or(base.input_terminator),
        shell: override_cfg.shell.or(base.shell),
        sampling: override_cfg.sampling.or(base.sampling),
        retry: override_cfg.retry.or(base.retry),
    }
}

/// Read the file at `path` as a config without env overrides. Used by `doctor`.
pub fn load_single_config_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let parsed: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(parsed.base)
}
