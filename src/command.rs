//! Turns a [`Profile`](crate::settings::Profile) into the `llama-server` command line.
//!
//! The mapping is a fixed table walk, so the same profile always yields the same
//! tokens in the same order. The preview string shown to the user is derived from the
//! exact vector that gets spawned.

use std::fmt;

use thiserror::Error;

use crate::settings::{CustomArgs, FlashAttention, ServerSettings, DEFAULT_HOST, DEFAULT_PORT};

/// Name of the server executable.
pub const SERVER_EXECUTABLE: &str = "llama-server";

/// `(flag, setting)` pairs emitted as `flag value` when the setting is non-blank.
const VALUE_FLAGS: &[(&str, &str)] = &[
    ("--host", "host"),
    ("--port", "port"),
    ("-a", "alias"),
    ("--api-key", "api_key"),
    ("-t", "threads"),
    ("-b", "batch_size"),
    ("-np", "parallel"),
    ("--lora", "lora_path"),
    ("--mmproj", "mmproj_path"),
    ("--chat-template", "chat_template"),
    ("-md", "draft_model_path"),
    ("-ngld", "draft_gpu_layers"),
    ("--draft", "draft_tokens"),
    ("--n-cpu-moe", "moe_cpu_layers"),
    ("--reasoning-format", "reasoning_format"),
    ("-ub", "ubatch_size"),
    ("-n", "n_predict"),
    ("--temp", "temp"),
    ("--top-k", "top_k"),
    ("--top-p", "top_p"),
    ("--repeat-penalty", "repeat_penalty"),
];

/// `(flag, setting)` pairs emitted as a bare flag when the setting is true.
const SWITCH_FLAGS: &[(&str, &str)] = &[
    ("--no-mmap", "no_mmap"),
    ("--no-webui", "no_webui"),
    ("-cb", "cont_batching"),
    ("--mlock", "mlock"),
    ("--embedding", "embedding"),
    ("--jinja", "jinja"),
    ("-v", "verbose"),
    ("--ignore-eos", "ignore_eos"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("model path is required")]
    MissingModelPath,
}

/// The program followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentVector {
    tokens: Vec<String>,
}

impl ArgumentVector {
    /// Builds a vector from an explicit program and arguments.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tokens = vec![program.into()];
        tokens.extend(args.into_iter().map(Into::into));
        Self { tokens }
    }

    pub fn program(&self) -> &str {
        &self.tokens[0]
    }

    pub fn args(&self) -> &[String] {
        &self.tokens[1..]
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    fn push(&mut self, token: impl Into<String>) {
        self.tokens.push(token.into());
    }

    fn push_pair(&mut self, flag: &str, value: impl Into<String>) {
        self.push(flag);
        self.push(value);
    }

    /// Joins the tokens for display, wrapping any token that contains whitespace in
    /// double quotes. Embedded quotes are not escaped; spawning never goes through
    /// this string.
    pub fn preview(&self) -> String {
        self.tokens()
            .iter()
            .map(|token| {
                if token.chars().any(char::is_whitespace) {
                    format!("\"{}\"", token)
                } else {
                    token.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for ArgumentVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.preview())
    }
}

/// Builds the server command line from the profile.
pub fn build_command(
    settings: &ServerSettings,
    custom_args: &CustomArgs,
) -> Result<ArgumentVector, ValidationError> {
    let model_path = settings.model_path.trim();
    if model_path.is_empty() {
        return Err(ValidationError::MissingModelPath);
    }

    let mut argv = ArgumentVector::new(SERVER_EXECUTABLE, ["-m", model_path]);
    argv.push_pair("-c", settings.ctx_size().to_string());
    argv.push_pair("-ngl", settings.gpu_layers().to_string());

    for (flag, name) in VALUE_FLAGS {
        let value = settings.text(name).unwrap_or_default().trim();
        if !value.is_empty() {
            argv.push_pair(flag, value);
        }
    }

    if let Some(effort) = settings.reasoning_effort {
        argv.push_pair("--chat-template-kwargs", effort.template_kwargs());
    }

    if settings.flash_attn != FlashAttention::Auto {
        argv.push_pair("-fa", settings.flash_attn.as_str());
    }

    for (flag, name) in SWITCH_FLAGS {
        if settings.flag(name).unwrap_or(false) {
            argv.push(*flag);
        }
    }

    if settings.numa {
        argv.push_pair("--numa", "distribute");
    }

    for token in custom_args.tokens() {
        argv.push(token);
    }

    Ok(argv)
}

/// Base URL of the running server, suitable for a browser or the health probe.
pub fn server_url(settings: &ServerSettings) -> String {
    let host = match settings.host.trim() {
        "" => DEFAULT_HOST,
        "0.0.0.0" => "localhost",
        other => other,
    };
    let port = match settings.port.trim() {
        "" => DEFAULT_PORT,
        other => other,
    };
    format!("http://{}:{}", host, port)
}
