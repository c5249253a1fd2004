//! Persistence of the launch profile as `llama_server_config.json`.
//!
//! The document is one flat JSON object. Every key is optional on load and unknown keys
//! are ignored, so files written by older or newer versions keep loading.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::settings::{
    parse_bool, CustomArgs, CustomArgument, FlashAttention, Profile, ReasoningEffort,
    ServerSettings, DEFAULT_HOST, DEFAULT_PORT,
};

/// File name of the configuration document, next to the executable.
pub const CONFIG_FILE_NAME: &str = "llama_server_config.json";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read or write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode configuration: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Default location: the directory holding the running executable.
pub fn default_config_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join(CONFIG_FILE_NAME))
}

/// On-disk shape of the profile. Field names are the JSON keys.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ConfigDocument {
    #[serde(deserialize_with = "lenient_text")]
    model_path: String,
    #[serde(deserialize_with = "lenient_text")]
    alias: String,
    #[serde(deserialize_with = "lenient_text")]
    lora_path: String,
    #[serde(deserialize_with = "lenient_text")]
    mmproj_path: String,
    #[serde(deserialize_with = "lenient_text")]
    chat_template: String,
    #[serde(deserialize_with = "lenient_text")]
    reasoning_format: String,
    #[serde(deserialize_with = "lenient_text")]
    reasoning_effort: String,
    #[serde(deserialize_with = "lenient_bool")]
    jinja: bool,
    #[serde(deserialize_with = "lenient_text")]
    n_predict: String,
    #[serde(deserialize_with = "lenient_bool")]
    ignore_eos: bool,
    #[serde(deserialize_with = "lenient_text")]
    temp: String,
    #[serde(deserialize_with = "lenient_text")]
    top_k: String,
    #[serde(deserialize_with = "lenient_text")]
    top_p: String,
    #[serde(deserialize_with = "lenient_text")]
    repeat_penalty: String,
    #[serde(deserialize_with = "lenient_int")]
    ctx_size: Option<i64>,
    #[serde(deserialize_with = "lenient_int")]
    gpu_layers: Option<i64>,
    #[serde(deserialize_with = "lenient_text")]
    threads: String,
    #[serde(deserialize_with = "lenient_text")]
    batch_size: String,
    #[serde(deserialize_with = "lenient_text")]
    ubatch_size: String,
    #[serde(deserialize_with = "lenient_text")]
    parallel: String,
    #[serde(deserialize_with = "lenient_bool")]
    cont_batching: bool,
    #[serde(deserialize_with = "flash_attn_value")]
    flash_attn: String,
    #[serde(deserialize_with = "lenient_text")]
    moe_cpu_layers: String,
    #[serde(deserialize_with = "lenient_bool")]
    mlock: bool,
    #[serde(deserialize_with = "lenient_bool")]
    no_mmap: bool,
    #[serde(deserialize_with = "lenient_bool")]
    numa: bool,
    #[serde(deserialize_with = "lenient_text")]
    draft_model_path: String,
    #[serde(deserialize_with = "lenient_text")]
    draft_gpu_layers: String,
    #[serde(deserialize_with = "lenient_text")]
    draft_tokens: String,
    #[serde(deserialize_with = "host_text")]
    host: String,
    #[serde(deserialize_with = "port_text")]
    port: String,
    #[serde(deserialize_with = "lenient_text")]
    api_key: String,
    #[serde(deserialize_with = "lenient_bool")]
    no_webui: bool,
    #[serde(deserialize_with = "lenient_bool")]
    embedding: bool,
    #[serde(deserialize_with = "lenient_bool")]
    verbose: bool,
    #[serde(deserialize_with = "lenient_list")]
    custom_arguments_list: Vec<CustomArgument>,
    /// Single free-text field written by old versions.
    #[serde(skip_serializing, deserialize_with = "lenient_text")]
    custom_args: String,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        ConfigDocument::from_profile(&Profile::default())
    }
}

impl ConfigDocument {
    fn from_profile(profile: &Profile) -> Self {
        let s = &profile.settings;
        Self {
            model_path: s.model_path.clone(),
            alias: s.alias.clone(),
            lora_path: s.lora_path.clone(),
            mmproj_path: s.mmproj_path.clone(),
            chat_template: s.chat_template.clone(),
            reasoning_format: s.reasoning_format.clone(),
            reasoning_effort: s
                .reasoning_effort
                .map(|effort| effort.as_str().to_string())
                .unwrap_or_default(),
            jinja: s.jinja,
            n_predict: s.n_predict.clone(),
            ignore_eos: s.ignore_eos,
            temp: s.temp.clone(),
            top_k: s.top_k.clone(),
            top_p: s.top_p.clone(),
            repeat_penalty: s.repeat_penalty.clone(),
            ctx_size: Some(i64::from(s.ctx_size())),
            gpu_layers: Some(i64::from(s.gpu_layers())),
            threads: s.threads.clone(),
            batch_size: s.batch_size.clone(),
            ubatch_size: s.ubatch_size.clone(),
            parallel: s.parallel.clone(),
            cont_batching: s.cont_batching,
            flash_attn: s.flash_attn.to_string(),
            moe_cpu_layers: s.moe_cpu_layers.clone(),
            mlock: s.mlock,
            no_mmap: s.no_mmap,
            numa: s.numa,
            draft_model_path: s.draft_model_path.clone(),
            draft_gpu_layers: s.draft_gpu_layers.clone(),
            draft_tokens: s.draft_tokens.clone(),
            host: s.host.clone(),
            port: s.port.clone(),
            api_key: s.api_key.clone(),
            no_webui: s.no_webui,
            embedding: s.embedding,
            verbose: s.verbose,
            custom_arguments_list: profile.custom_args.iter().cloned().collect(),
            custom_args: String::new(),
        }
    }

    fn into_profile(self) -> Profile {
        let flash_attn = self.flash_attn.parse().unwrap_or_else(|_| {
            tracing::warn!(value = %self.flash_attn, "unknown flash_attn value, using auto");
            FlashAttention::Auto
        });
        let reasoning_effort =
            ReasoningEffort::parse_optional(&self.reasoning_effort).unwrap_or_else(|_| {
                tracing::warn!(
                    value = %self.reasoning_effort,
                    "unknown reasoning_effort value, ignoring"
                );
                None
            });

        let mut custom_args = self.custom_arguments_list;
        let legacy = self.custom_args.trim();
        if custom_args.is_empty() && !legacy.is_empty() {
            tracing::info!("migrating legacy custom_args into the custom argument list");
            custom_args.push(CustomArgument::new(legacy));
        }

        let mut settings = ServerSettings::default();
        settings.model_path = self.model_path;
        settings.alias = self.alias;
        settings.lora_path = self.lora_path;
        settings.mmproj_path = self.mmproj_path;
        settings.chat_template = self.chat_template;
        settings.reasoning_format = self.reasoning_format;
        settings.reasoning_effort = reasoning_effort;
        settings.jinja = self.jinja;
        settings.n_predict = self.n_predict;
        settings.ignore_eos = self.ignore_eos;
        settings.temp = self.temp;
        settings.top_k = self.top_k;
        settings.top_p = self.top_p;
        settings.repeat_penalty = self.repeat_penalty;
        settings.threads = self.threads;
        settings.batch_size = self.batch_size;
        settings.ubatch_size = self.ubatch_size;
        settings.parallel = self.parallel;
        settings.cont_batching = self.cont_batching;
        settings.flash_attn = flash_attn;
        settings.moe_cpu_layers = self.moe_cpu_layers;
        settings.mlock = self.mlock;
        settings.no_mmap = self.no_mmap;
        settings.numa = self.numa;
        settings.draft_model_path = self.draft_model_path;
        settings.draft_gpu_layers = self.draft_gpu_layers;
        settings.draft_tokens = self.draft_tokens;
        settings.host = self.host;
        settings.port = self.port;
        settings.api_key = self.api_key;
        settings.no_webui = self.no_webui;
        settings.embedding = self.embedding;
        settings.verbose = self.verbose;
        if let Some(ctx_size) = self.ctx_size {
            settings.set_ctx_size(ctx_size);
        }
        if let Some(gpu_layers) = self.gpu_layers {
            settings.set_gpu_layers(gpu_layers);
        }

        Profile {
            settings,
            custom_args: CustomArgs::from_entries(custom_args),
        }
    }
}

// Older files may hold numbers where text is expected, or null.
fn text_or<'de, D>(deserializer: D, default: &str) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => default.to_string(),
    })
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    text_or(deserializer, "")
}

fn host_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    text_or(deserializer, DEFAULT_HOST)
}

fn port_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    text_or(deserializer, DEFAULT_PORT)
}

// Checkboxes were stored as 0/1 by some versions.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(flag) => flag,
        Value::Number(number) => number.as_f64().is_some_and(|value| value != 0.0),
        Value::String(text) => parse_bool(&text).unwrap_or(false),
        _ => false,
    })
}

// A null list counts as empty; entries that do not decode are dropped.
fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<CustomArgument>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(argument) => Some(argument),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed custom argument");
                None
            }
        })
        .collect())
}

// Slider values; anything unusable falls back to the default.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value.round() as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

// Flash attention used to be a checkbox.
fn flash_attn_value<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(true) => FlashAttention::On.to_string(),
        Value::Bool(false) | Value::Null => FlashAttention::Auto.to_string(),
        Value::String(text) => text,
        other => other.to_string(),
    })
}

/// Serializes the profile to the JSON document text.
pub fn to_document(profile: &Profile) -> Result<String, PersistenceError> {
    let document = ConfigDocument::from_profile(profile);
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    document.serialize(&mut serializer)?;
    // serde_json only ever emits UTF-8.
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Parses document text into a profile.
pub fn from_document(text: &str) -> Result<Profile, serde_json::Error> {
    let document: ConfigDocument = serde_json::from_str(text)?;
    Ok(document.into_profile())
}

/// Loads the profile stored at `path`.
pub fn load_config(path: &Path) -> Result<Profile, PersistenceError> {
    let raw = fs::read_to_string(path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    from_document(&raw).map_err(|source| PersistenceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the profile at `path`, or the defaults when the file does not exist yet.
pub fn load_or_default(path: &Path) -> Result<Profile, PersistenceError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no configuration file, using defaults");
        return Ok(Profile::default());
    }
    load_config(path)
}

/// Writes the profile to `path` through a sibling temp file and a rename.
pub fn save_config(path: &Path, profile: &Profile) -> Result<(), PersistenceError> {
    let text = to_document(profile)?;
    let io_error = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, text).map_err(io_error)?;
    fs::rename(&tmp, path).map_err(io_error)?;
    tracing::debug!(path = %path.display(), "saved configuration");
    Ok(())
}

impl Profile {
    /// Replaces this profile with the one stored at `path`.
    ///
    /// On error the current values are left exactly as they were.
    pub fn reload(&mut self, path: &Path) -> Result<(), PersistenceError> {
        let loaded = load_config(path)?;
        *self = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SETTINGS;

    fn sample_profile() -> Profile {
        let mut profile = Profile::default();
        let s = &mut profile.settings;
        s.set("model_path", "/models/My Model.gguf").unwrap();
        s.set("alias", "assistant").unwrap();
        s.set("ctx_size", "16384").unwrap();
        s.set("gpu_layers", "33").unwrap();
        s.set("threads", "12").unwrap();
        s.set("temp", "0.6").unwrap();
        s.set("flash_attn", "off").unwrap();
        s.set("reasoning_effort", "medium").unwrap();
        s.set("numa", "true").unwrap();
        s.set("no_webui", "true").unwrap();
        s.set("host", "0.0.0.0").unwrap();
        profile.custom_args.add("--foo bar").unwrap();
        profile.custom_args.add("--metrics").unwrap();
        profile.custom_args.toggle(1).unwrap();
        profile
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let profile = sample_profile();
        save_config(&path, &profile).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, profile);
    }

    #[test]
    fn document_contains_every_setting() {
        let text = to_document(&Profile::default()).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        let object = value.as_object().unwrap();
        for spec in SETTINGS {
            assert!(object.contains_key(spec.name), "missing {}", spec.name);
        }
        assert!(object.contains_key("custom_arguments_list"));
        assert!(!object.contains_key("custom_args"));
        assert!(text.contains("\n    \"model_path\""));
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let profile = from_document("{}").unwrap();
        assert_eq!(profile, Profile::default());

        let profile = from_document(r#"{"model_path": "a.gguf", "mlock": true}"#).unwrap();
        assert_eq!(profile.settings.model_path, "a.gguf");
        assert!(profile.settings.mlock);
        assert_eq!(profile.settings.host, "127.0.0.1");
        assert_eq!(profile.settings.port, "8080");
        assert_eq!(profile.settings.ctx_size(), 4096);
        assert_eq!(profile.settings.gpu_layers(), 99);
        assert_eq!(profile.settings.flash_attn, FlashAttention::Auto);
        assert!(profile.custom_args.is_empty());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let profile =
            from_document(r#"{"model_path": "a.gguf", "theme": "dark", "window": {"w": 3}}"#)
                .unwrap();
        assert_eq!(profile.settings.model_path, "a.gguf");
    }

    #[test]
    fn legacy_custom_args_migrates_when_list_is_absent_or_empty() {
        let profile = from_document(r#"{"custom_args": "  --foo bar  "}"#).unwrap();
        let entries: Vec<_> = profile.custom_args.iter().cloned().collect();
        assert_eq!(entries, vec![CustomArgument::new("--foo bar")]);

        let profile =
            from_document(r#"{"custom_args": "--foo", "custom_arguments_list": []}"#).unwrap();
        assert_eq!(profile.custom_args.len(), 1);

        let profile = from_document(
            r#"{
                "custom_args": "--old",
                "custom_arguments_list": [{"value": "--new", "enabled": false}]
            }"#,
        )
        .unwrap();
        let entries: Vec<_> = profile.custom_args.iter().cloned().collect();
        assert_eq!(
            entries,
            vec![CustomArgument {
                value: "--new".to_string(),
                enabled: false
            }]
        );

        let profile = from_document(r#"{"custom_args": "   "}"#).unwrap();
        assert!(profile.custom_args.is_empty());
    }

    #[test]
    fn legacy_value_shapes_are_accepted() {
        let profile = from_document(
            r#"{
                "flash_attn": true,
                "threads": 8,
                "port": 8081,
                "ctx_size": 5000,
                "reasoning_effort": "extreme"
            }"#,
        )
        .unwrap();
        assert_eq!(profile.settings.flash_attn, FlashAttention::On);
        assert_eq!(profile.settings.threads, "8");
        assert_eq!(profile.settings.port, "8081");
        assert_eq!(profile.settings.ctx_size(), 5120);
        assert_eq!(profile.settings.reasoning_effort, None);

        let profile = from_document(r#"{"flash_attn": false}"#).unwrap();
        assert_eq!(profile.settings.flash_attn, FlashAttention::Auto);
    }

    #[test]
    fn off_type_values_do_not_reject_the_file() {
        let profile = from_document(
            r#"{"mlock": 1, "numa": "true", "jinja": 0, "verbose": null, "no_mmap": "yes"}"#,
        )
        .unwrap();
        assert!(profile.settings.mlock);
        assert!(profile.settings.numa);
        assert!(!profile.settings.jinja);
        assert!(!profile.settings.verbose);
        assert!(profile.settings.no_mmap);

        let profile = from_document(r#"{"host": null, "port": null, "alias": null}"#).unwrap();
        assert_eq!(profile.settings.host, "127.0.0.1");
        assert_eq!(profile.settings.port, "8080");
        assert_eq!(profile.settings.alias, "");

        let profile =
            from_document(r#"{"custom_arguments_list": null, "custom_args": "--x"}"#).unwrap();
        let entries: Vec<_> = profile.custom_args.iter().cloned().collect();
        assert_eq!(entries, vec![CustomArgument::new("--x")]);

        let profile =
            from_document(r#"{"custom_arguments_list": [{"value": "--a"}, 7, {"value": []}]}"#)
                .unwrap();
        let entries: Vec<_> = profile.custom_args.iter().cloned().collect();
        assert_eq!(entries, vec![CustomArgument::new("--a")]);
    }

    #[test]
    fn huge_slider_values_clamp_to_the_range() {
        let profile = from_document(r#"{"ctx_size": 1e300, "gpu_layers": -1e300}"#).unwrap();
        assert_eq!(profile.settings.ctx_size(), 131_072);
        assert_eq!(profile.settings.gpu_layers(), 0);

        let profile = from_document(r#"{"ctx_size": 9223372036854775807}"#).unwrap();
        assert_eq!(profile.settings.ctx_size(), 131_072);
    }

    #[test]
    fn failed_save_leaves_previous_document_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        save_config(&path, &Profile::default()).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        // A directory in the way of the temp file makes the write fail.
        fs::create_dir(dir.path().join(format!("{}.tmp", CONFIG_FILE_NAME))).unwrap();
        let err = save_config(&path, &sample_profile()).unwrap_err();
        assert!(matches!(err, PersistenceError::Io { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert_eq!(load_config(&path).unwrap(), Profile::default());
    }

    #[test]
    fn custom_argument_enabled_defaults_to_true() {
        let profile = from_document(r#"{"custom_arguments_list": [{"value": "--x"}]}"#).unwrap();
        assert!(profile.custom_args.get(0).unwrap().enabled);
    }

    #[test]
    fn failed_reload_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();

        let mut profile = sample_profile();
        let before = profile.clone();
        let err = profile.reload(&broken).unwrap_err();
        assert!(matches!(err, PersistenceError::Parse { .. }));
        assert_eq!(profile, before);

        let err = profile.reload(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, PersistenceError::Io { .. }));
        assert_eq!(profile, before);
    }

    #[test]
    fn load_or_default_handles_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let profile = load_or_default(&dir.path().join("none.json")).unwrap();
        assert_eq!(profile, Profile::default());
    }
}
