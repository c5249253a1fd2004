//! The launch profile: typed `llama-server` settings plus the custom argument list.
//!
//! Every setting has a stable name that doubles as its key in the JSON configuration
//! file and as the identifier accepted by `llamarack set`. The table in [`SETTINGS`]
//! is the single source of truth for names, kinds and the server flag each one feeds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host the server listens on when nothing else is configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Port the server listens on when nothing else is configured.
pub const DEFAULT_PORT: &str = "8080";

/// An integer setting that snaps to a resolution inside an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slider {
    pub low: u32,
    pub high: u32,
    pub resolution: u32,
}

impl Slider {
    pub const fn new(low: u32, high: u32, resolution: u32) -> Self {
        Self {
            low,
            high,
            resolution,
        }
    }

    /// Rounds `raw` to the nearest multiple of the resolution (ties round up) and clamps
    /// the result into `[low, high]`.
    pub fn snap(&self, raw: i64) -> u32 {
        let (low, high) = (i64::from(self.low), i64::from(self.high));
        let resolution = i64::from(self.resolution.max(1));
        // Clamping first keeps the rounding sum far from i64 overflow.
        let raw = raw.clamp(low, high);
        let rounded = (raw + resolution / 2).div_euclid(resolution) * resolution;
        rounded.clamp(low, high) as u32
    }
}

/// Context size slider (`-c`).
pub const CTX_SIZE: Slider = Slider::new(0, 131_072, 1024);
/// GPU layer offload slider (`-ngl`); 99 offloads everything.
pub const GPU_LAYERS: Slider = Slider::new(0, 99, 1);

/// Flash attention mode passed through `-fa`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlashAttention {
    On,
    Off,
    #[default]
    Auto,
}

impl FlashAttention {
    pub const CHOICES: &'static [&'static str] = &["on", "off", "auto"];

    pub fn as_str(self) -> &'static str {
        match self {
            FlashAttention::On => "on",
            FlashAttention::Off => "off",
            FlashAttention::Auto => "auto",
        }
    }
}

impl fmt::Display for FlashAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlashAttention {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(FlashAttention::On),
            "off" => Ok(FlashAttention::Off),
            "auto" => Ok(FlashAttention::Auto),
            _ => Err(()),
        }
    }
}

/// Reasoning effort hint, forwarded to the chat template as a JSON kwarg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub const CHOICES: &'static [&'static str] = &["", "low", "medium", "high"];

    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }

    /// The value of `--chat-template-kwargs`: a single-key JSON object.
    pub fn template_kwargs(self) -> String {
        serde_json::json!({ "reasoning_effort": self.as_str() }).to_string()
    }

    /// Parses the stored form, where an empty string means "not set".
    pub fn parse_optional(value: &str) -> Result<Option<Self>, ()> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "low" => Ok(Some(ReasoningEffort::Low)),
            "medium" => Ok(Some(ReasoningEffort::Medium)),
            "high" => Ok(Some(ReasoningEffort::High)),
            _ => Err(()),
        }
    }
}

/// How a setting is edited and validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    /// Free text; empty means "not passed".
    Text,
    /// Optional number kept as text; empty means "not passed".
    Number,
    /// Snapped integer.
    Integer(Slider),
    /// Bare switch.
    Boolean,
    /// One of a closed set of strings.
    Choice(&'static [&'static str]),
}

impl SettingKind {
    pub fn label(&self) -> &'static str {
        match self {
            SettingKind::Text => "text",
            SettingKind::Number => "number",
            SettingKind::Integer(_) => "integer",
            SettingKind::Boolean => "boolean",
            SettingKind::Choice(_) => "choice",
        }
    }
}

/// Static description of one named setting.
#[derive(Debug, Clone, Copy)]
pub struct SettingSpec {
    pub name: &'static str,
    pub kind: SettingKind,
    /// The `llama-server` flag this setting drives.
    pub flag: &'static str,
    pub help: &'static str,
}

const fn spec(
    name: &'static str,
    kind: SettingKind,
    flag: &'static str,
    help: &'static str,
) -> SettingSpec {
    SettingSpec {
        name,
        kind,
        flag,
        help,
    }
}

/// All settings, in display order.
pub const SETTINGS: &[SettingSpec] = &[
    spec("model_path", SettingKind::Text, "-m", "Path to the GGUF model file (required)"),
    spec("alias", SettingKind::Text, "-a", "Model alias used in API calls"),
    spec("lora_path", SettingKind::Text, "--lora", "LoRA adapter file"),
    spec("mmproj_path", SettingKind::Text, "--mmproj", "Multimodal projector file"),
    spec(
        "chat_template",
        SettingKind::Text,
        "--chat-template",
        "Chat template name (blank = from model)",
    ),
    spec(
        "reasoning_format",
        SettingKind::Text,
        "--reasoning-format",
        "Thought tag handling (auto, none, deepseek)",
    ),
    spec(
        "reasoning_effort",
        SettingKind::Choice(ReasoningEffort::CHOICES),
        "--chat-template-kwargs",
        "Reasoning effort passed to the chat template",
    ),
    spec("jinja", SettingKind::Boolean, "--jinja", "Enable Jinja chat templating"),
    spec("n_predict", SettingKind::Number, "-n", "Tokens to generate (-1 = infinite)"),
    spec("ignore_eos", SettingKind::Boolean, "--ignore-eos", "Ignore end-of-sequence tokens"),
    spec("temp", SettingKind::Number, "--temp", "Sampling temperature"),
    spec("top_k", SettingKind::Number, "--top-k", "Top-k sampling"),
    spec("top_p", SettingKind::Number, "--top-p", "Nucleus sampling"),
    spec("repeat_penalty", SettingKind::Number, "--repeat-penalty", "Repetition penalty"),
    spec("ctx_size", SettingKind::Integer(CTX_SIZE), "-c", "Context size"),
    spec(
        "gpu_layers",
        SettingKind::Integer(GPU_LAYERS),
        "-ngl",
        "Layers offloaded to the GPU (99 = all)",
    ),
    spec("threads", SettingKind::Number, "-t", "CPU threads"),
    spec("batch_size", SettingKind::Number, "-b", "Logical batch size"),
    spec("ubatch_size", SettingKind::Number, "-ub", "Physical batch size"),
    spec("parallel", SettingKind::Number, "-np", "Parallel sequences"),
    spec("cont_batching", SettingKind::Boolean, "-cb", "Continuous batching"),
    spec("flash_attn", SettingKind::Choice(FlashAttention::CHOICES), "-fa", "Flash attention mode"),
    spec("moe_cpu_layers", SettingKind::Number, "--n-cpu-moe", "MoE layers kept on the CPU"),
    spec("mlock", SettingKind::Boolean, "--mlock", "Lock the model in RAM"),
    spec("no_mmap", SettingKind::Boolean, "--no-mmap", "Disable memory mapping"),
    spec("numa", SettingKind::Boolean, "--numa", "NUMA-aware distribution"),
    spec("draft_model_path", SettingKind::Text, "-md", "Draft model for speculative decoding"),
    spec("draft_gpu_layers", SettingKind::Number, "-ngld", "GPU layers for the draft model"),
    spec("draft_tokens", SettingKind::Number, "--draft", "Tokens to draft"),
    spec("host", SettingKind::Text, "--host", "Listen address"),
    spec("port", SettingKind::Text, "--port", "Listen port"),
    spec("api_key", SettingKind::Text, "--api-key", "Bearer token required by the API"),
    spec("no_webui", SettingKind::Boolean, "--no-webui", "Disable the built-in web UI"),
    spec("embedding", SettingKind::Boolean, "--embedding", "Embedding-only mode"),
    spec("verbose", SettingKind::Boolean, "-v", "Verbose server logging"),
];

/// Looks up a setting by name.
pub fn setting_spec(name: &str) -> Option<&'static SettingSpec> {
    SETTINGS.iter().find(|spec| spec.name == name)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingError {
    #[error("unknown setting '{0}'")]
    Unknown(String),
    #[error("{name}: '{value}' is not a number")]
    NotANumber { name: String, value: String },
    #[error("{name}: '{value}' is not an integer")]
    NotAnInteger { name: String, value: String },
    #[error("{name}: '{value}' is not a boolean (use true/false)")]
    NotABoolean { name: String, value: String },
    #[error("{name}: '{value}' is not one of {choices}")]
    InvalidChoice {
        name: String,
        value: String,
        choices: String,
    },
}

/// Typed values for every named setting.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub model_path: String,
    pub alias: String,
    pub lora_path: String,
    pub mmproj_path: String,
    pub chat_template: String,
    pub reasoning_format: String,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub jinja: bool,
    pub n_predict: String,
    pub ignore_eos: bool,
    pub temp: String,
    pub top_k: String,
    pub top_p: String,
    pub repeat_penalty: String,
    ctx_size: u32,
    gpu_layers: u32,
    pub threads: String,
    pub batch_size: String,
    pub ubatch_size: String,
    pub parallel: String,
    pub cont_batching: bool,
    pub flash_attn: FlashAttention,
    pub moe_cpu_layers: String,
    pub mlock: bool,
    pub no_mmap: bool,
    pub numa: bool,
    pub draft_model_path: String,
    pub draft_gpu_layers: String,
    pub draft_tokens: String,
    pub host: String,
    pub port: String,
    pub api_key: String,
    pub no_webui: bool,
    pub embedding: bool,
    pub verbose: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            alias: String::new(),
            lora_path: String::new(),
            mmproj_path: String::new(),
            chat_template: String::new(),
            reasoning_format: String::new(),
            reasoning_effort: None,
            jinja: false,
            n_predict: String::new(),
            ignore_eos: false,
            temp: String::new(),
            top_k: String::new(),
            top_p: String::new(),
            repeat_penalty: String::new(),
            ctx_size: 4096,
            gpu_layers: 99,
            threads: String::new(),
            batch_size: String::new(),
            ubatch_size: String::new(),
            parallel: String::new(),
            cont_batching: false,
            flash_attn: FlashAttention::Auto,
            moe_cpu_layers: String::new(),
            mlock: false,
            no_mmap: false,
            numa: false,
            draft_model_path: String::new(),
            draft_gpu_layers: String::new(),
            draft_tokens: String::new(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT.to_string(),
            api_key: String::new(),
            no_webui: false,
            embedding: false,
            verbose: false,
        }
    }
}

impl ServerSettings {
    pub fn ctx_size(&self) -> u32 {
        self.ctx_size
    }

    pub fn gpu_layers(&self) -> u32 {
        self.gpu_layers
    }

    pub fn set_ctx_size(&mut self, raw: i64) {
        self.ctx_size = CTX_SIZE.snap(raw);
    }

    pub fn set_gpu_layers(&mut self, raw: i64) {
        self.gpu_layers = GPU_LAYERS.snap(raw);
    }

    /// Current value of a text or number setting.
    pub fn text(&self, name: &str) -> Option<&str> {
        let value = match name {
            "model_path" => &self.model_path,
            "alias" => &self.alias,
            "lora_path" => &self.lora_path,
            "mmproj_path" => &self.mmproj_path,
            "chat_template" => &self.chat_template,
            "reasoning_format" => &self.reasoning_format,
            "n_predict" => &self.n_predict,
            "temp" => &self.temp,
            "top_k" => &self.top_k,
            "top_p" => &self.top_p,
            "repeat_penalty" => &self.repeat_penalty,
            "threads" => &self.threads,
            "batch_size" => &self.batch_size,
            "ubatch_size" => &self.ubatch_size,
            "parallel" => &self.parallel,
            "moe_cpu_layers" => &self.moe_cpu_layers,
            "draft_model_path" => &self.draft_model_path,
            "draft_gpu_layers" => &self.draft_gpu_layers,
            "draft_tokens" => &self.draft_tokens,
            "host" => &self.host,
            "port" => &self.port,
            "api_key" => &self.api_key,
            _ => return None,
        };
        Some(value.as_str())
    }

    fn text_mut(&mut self, name: &str) -> Option<&mut String> {
        let value = match name {
            "model_path" => &mut self.model_path,
            "alias" => &mut self.alias,
            "lora_path" => &mut self.lora_path,
            "mmproj_path" => &mut self.mmproj_path,
            "chat_template" => &mut self.chat_template,
            "reasoning_format" => &mut self.reasoning_format,
            "n_predict" => &mut self.n_predict,
            "temp" => &mut self.temp,
            "top_k" => &mut self.top_k,
            "top_p" => &mut self.top_p,
            "repeat_penalty" => &mut self.repeat_penalty,
            "threads" => &mut self.threads,
            "batch_size" => &mut self.batch_size,
            "ubatch_size" => &mut self.ubatch_size,
            "parallel" => &mut self.parallel,
            "moe_cpu_layers" => &mut self.moe_cpu_layers,
            "draft_model_path" => &mut self.draft_model_path,
            "draft_gpu_layers" => &mut self.draft_gpu_layers,
            "draft_tokens" => &mut self.draft_tokens,
            "host" => &mut self.host,
            "port" => &mut self.port,
            "api_key" => &mut self.api_key,
            _ => return None,
        };
        Some(value)
    }

    /// Current value of a boolean setting.
    pub fn flag(&self, name: &str) -> Option<bool> {
        let value = match name {
            "jinja" => self.jinja,
            "ignore_eos" => self.ignore_eos,
            "cont_batching" => self.cont_batching,
            "mlock" => self.mlock,
            "no_mmap" => self.no_mmap,
            "numa" => self.numa,
            "no_webui" => self.no_webui,
            "embedding" => self.embedding,
            "verbose" => self.verbose,
            _ => return None,
        };
        Some(value)
    }

    fn flag_mut(&mut self, name: &str) -> Option<&mut bool> {
        let value = match name {
            "jinja" => &mut self.jinja,
            "ignore_eos" => &mut self.ignore_eos,
            "cont_batching" => &mut self.cont_batching,
            "mlock" => &mut self.mlock,
            "no_mmap" => &mut self.no_mmap,
            "numa" => &mut self.numa,
            "no_webui" => &mut self.no_webui,
            "embedding" => &mut self.embedding,
            "verbose" => &mut self.verbose,
            _ => return None,
        };
        Some(value)
    }

    /// Renders any setting the way `set` accepts it back.
    pub fn value(&self, name: &str) -> Option<String> {
        if let Some(text) = self.text(name) {
            return Some(text.to_string());
        }
        if let Some(flag) = self.flag(name) {
            return Some(flag.to_string());
        }
        match name {
            "ctx_size" => Some(self.ctx_size.to_string()),
            "gpu_layers" => Some(self.gpu_layers.to_string()),
            "flash_attn" => Some(self.flash_attn.to_string()),
            "reasoning_effort" => Some(
                self.reasoning_effort
                    .map(|effort| effort.as_str().to_string())
                    .unwrap_or_default(),
            ),
            _ => None,
        }
    }

    /// Parses `raw` according to the setting's kind and assigns it.
    ///
    /// Text values are stored as given; whitespace is trimmed only when the command
    /// is built. Sliders are snapped.
    pub fn set(&mut self, name: &str, raw: &str) -> Result<(), SettingError> {
        let spec = setting_spec(name).ok_or_else(|| SettingError::Unknown(name.to_string()))?;
        match spec.kind {
            SettingKind::Text => {
                if let Some(slot) = self.text_mut(name) {
                    *slot = raw.to_string();
                }
            }
            SettingKind::Number => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() && trimmed.parse::<f64>().is_err() {
                    return Err(SettingError::NotANumber {
                        name: name.to_string(),
                        value: raw.to_string(),
                    });
                }
                if let Some(slot) = self.text_mut(name) {
                    *slot = trimmed.to_string();
                }
            }
            SettingKind::Integer(slider) => {
                let parsed = raw
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| SettingError::NotAnInteger {
                        name: name.to_string(),
                        value: raw.to_string(),
                    })?;
                let snapped = slider.snap(parsed);
                match name {
                    "ctx_size" => self.ctx_size = snapped,
                    "gpu_layers" => self.gpu_layers = snapped,
                    _ => {}
                }
            }
            SettingKind::Boolean => {
                let parsed = parse_bool(raw).ok_or_else(|| SettingError::NotABoolean {
                    name: name.to_string(),
                    value: raw.to_string(),
                })?;
                if let Some(slot) = self.flag_mut(name) {
                    *slot = parsed;
                }
            }
            SettingKind::Choice(choices) => {
                let invalid = || SettingError::InvalidChoice {
                    name: name.to_string(),
                    value: raw.to_string(),
                    choices: choices
                        .iter()
                        .filter(|choice| !choice.is_empty())
                        .copied()
                        .collect::<Vec<_>>()
                        .join(", "),
                };
                match name {
                    "flash_attn" => self.flash_attn = raw.parse().map_err(|_| invalid())?,
                    "reasoning_effort" => {
                        self.reasoning_effort =
                            ReasoningEffort::parse_optional(raw).map_err(|_| invalid())?
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Restores a single setting to its default value.
    pub fn unset(&mut self, name: &str) -> Result<(), SettingError> {
        let default = ServerSettings::default()
            .value(name)
            .ok_or_else(|| SettingError::Unknown(name.to_string()))?;
        self.set(name, &default)
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// A free-form fragment appended to the command line when enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomArgument {
    #[serde(default)]
    pub value: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl CustomArgument {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            enabled: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CustomArgError {
    #[error("argument is empty")]
    Empty,
    #[error("argument '{0}' already exists")]
    Duplicate(String),
    #[error("no argument at index {0}")]
    OutOfRange(usize),
}

/// Ordered custom arguments. Values are unique at insertion time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomArgs {
    entries: Vec<CustomArgument>,
}

impl CustomArgs {
    /// Wraps entries read from disk as-is.
    pub fn from_entries(entries: Vec<CustomArgument>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CustomArgument> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CustomArgument> {
        self.entries.iter()
    }

    /// Appends a trimmed, enabled entry. Returns its index.
    pub fn add(&mut self, raw: &str) -> Result<usize, CustomArgError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(CustomArgError::Empty);
        }
        if self.entries.iter().any(|entry| entry.value == value) {
            return Err(CustomArgError::Duplicate(value.to_string()));
        }
        self.entries.push(CustomArgument::new(value));
        Ok(self.entries.len() - 1)
    }

    /// Replaces the value of an entry. Uniqueness is not re-checked.
    pub fn edit(&mut self, index: usize, raw: &str) -> Result<(), CustomArgError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(CustomArgError::Empty);
        }
        let entry = self
            .entries
            .get_mut(index)
            .ok_or(CustomArgError::OutOfRange(index))?;
        entry.value = value.to_string();
        Ok(())
    }

    /// Flips the enabled flag and returns the new value.
    pub fn toggle(&mut self, index: usize) -> Result<bool, CustomArgError> {
        let enabled = !self
            .get(index)
            .ok_or(CustomArgError::OutOfRange(index))?
            .enabled;
        self.set_enabled(index, enabled)?;
        Ok(enabled)
    }

    pub fn set_enabled(&mut self, index: usize, enabled: bool) -> Result<(), CustomArgError> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or(CustomArgError::OutOfRange(index))?;
        entry.enabled = enabled;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<CustomArgument, CustomArgError> {
        if index >= self.entries.len() {
            return Err(CustomArgError::OutOfRange(index));
        }
        Ok(self.entries.remove(index))
    }

    /// Whitespace-split tokens of every enabled, non-blank entry, in list order.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|entry| entry.enabled)
            .flat_map(|entry| entry.value.split_whitespace())
    }
}

/// Everything persisted between sessions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub settings: ServerSettings,
    pub custom_args: CustomArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slider_snaps_to_resolution_and_clamps() {
        assert_eq!(CTX_SIZE.snap(4000), 4096);
        assert_eq!(CTX_SIZE.snap(4600), 4096);
        assert_eq!(CTX_SIZE.snap(4608), 5120);
        assert_eq!(CTX_SIZE.snap(-300), 0);
        assert_eq!(CTX_SIZE.snap(1_000_000), 131_072);
        assert_eq!(GPU_LAYERS.snap(42), 42);
        assert_eq!(GPU_LAYERS.snap(120), 99);
    }

    #[test]
    fn slider_clamps_extreme_values() {
        assert_eq!(CTX_SIZE.snap(i64::MAX), 131_072);
        assert_eq!(CTX_SIZE.snap(i64::MIN), 0);
        assert_eq!(GPU_LAYERS.snap(i64::MAX), 99);

        let mut settings = ServerSettings::default();
        settings.set("ctx_size", "9223372036854775807").unwrap();
        assert_eq!(settings.ctx_size(), 131_072);
        settings.set("gpu_layers", "-9223372036854775808").unwrap();
        assert_eq!(settings.gpu_layers(), 0);
    }

    #[test]
    fn set_parses_by_kind() {
        let mut settings = ServerSettings::default();
        settings.set("model_path", "models/qwen.gguf").unwrap();
        settings.set("threads", " 8 ").unwrap();
        settings.set("temp", "0.7").unwrap();
        settings.set("ctx_size", "8000").unwrap();
        settings.set("mlock", "yes").unwrap();
        settings.set("flash_attn", "ON").unwrap();
        settings.set("reasoning_effort", "high").unwrap();

        assert_eq!(settings.model_path, "models/qwen.gguf");
        assert_eq!(settings.threads, "8");
        assert_eq!(settings.temp, "0.7");
        assert_eq!(settings.ctx_size(), 8192);
        assert!(settings.mlock);
        assert_eq!(settings.flash_attn, FlashAttention::On);
        assert_eq!(settings.reasoning_effort, Some(ReasoningEffort::High));
    }

    #[test]
    fn set_rejects_bad_values_without_changing_state() {
        let mut settings = ServerSettings::default();
        let before = settings.clone();
        assert!(matches!(
            settings.set("threads", "many"),
            Err(SettingError::NotANumber { .. })
        ));
        assert!(matches!(
            settings.set("gpu_layers", "1.5"),
            Err(SettingError::NotAnInteger { .. })
        ));
        assert!(matches!(
            settings.set("numa", "maybe"),
            Err(SettingError::NotABoolean { .. })
        ));
        assert!(matches!(
            settings.set("flash_attn", "fast"),
            Err(SettingError::InvalidChoice { .. })
        ));
        assert_eq!(
            settings.set("nope", "1"),
            Err(SettingError::Unknown("nope".to_string()))
        );
        assert_eq!(settings, before);
    }

    #[test]
    fn unset_restores_defaults() {
        let mut settings = ServerSettings::default();
        settings.set("host", "0.0.0.0").unwrap();
        settings.set("gpu_layers", "10").unwrap();
        settings.set("reasoning_effort", "low").unwrap();
        settings.unset("host").unwrap();
        settings.unset("gpu_layers").unwrap();
        settings.unset("reasoning_effort").unwrap();
        assert_eq!(settings, ServerSettings::default());
    }

    #[test]
    fn every_spec_has_a_value() {
        let settings = ServerSettings::default();
        for spec in SETTINGS {
            assert!(settings.value(spec.name).is_some(), "{}", spec.name);
        }
    }

    #[test]
    fn reasoning_effort_kwargs_is_json() {
        let kwargs = ReasoningEffort::Medium.template_kwargs();
        let parsed: serde_json::Value = serde_json::from_str(&kwargs).unwrap();
        assert_eq!(parsed, serde_json::json!({ "reasoning_effort": "medium" }));
    }

    #[test]
    fn custom_args_reject_duplicates_and_blanks() {
        let mut args = CustomArgs::default();
        assert_eq!(args.add("  --foo bar "), Ok(0));
        assert_eq!(
            args.add("--foo bar"),
            Err(CustomArgError::Duplicate("--foo bar".to_string()))
        );
        assert_eq!(args.add("   "), Err(CustomArgError::Empty));
        assert_eq!(args.len(), 1);
        assert_eq!(args.get(0).unwrap().value, "--foo bar");
    }

    #[test]
    fn custom_args_edit_toggle_remove() {
        let mut args = CustomArgs::default();
        args.add("--a").unwrap();
        args.add("--b 1").unwrap();

        // Edits may collide with another entry; only insertion is checked.
        args.edit(1, "--a").unwrap();
        assert_eq!(args.get(1).unwrap().value, "--a");
        assert_eq!(args.edit(0, " "), Err(CustomArgError::Empty));
        assert_eq!(args.edit(5, "--c"), Err(CustomArgError::OutOfRange(5)));

        assert_eq!(args.toggle(0), Ok(false));
        assert_eq!(args.tokens().collect::<Vec<_>>(), vec!["--a"]);

        let removed = args.remove(0).unwrap();
        assert_eq!(removed.value, "--a");
        assert!(!removed.enabled);
        assert_eq!(args.remove(3), Err(CustomArgError::OutOfRange(3)));
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn tokens_skip_disabled_and_split_whitespace() {
        let mut args = CustomArgs::default();
        args.add("--foo   bar").unwrap();
        args.add("--skip me").unwrap();
        args.add("--baz").unwrap();
        args.set_enabled(1, false).unwrap();
        assert_eq!(args.tokens().collect::<Vec<_>>(), vec!["--foo", "bar", "--baz"]);
    }
}
