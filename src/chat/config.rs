//! Configuration types for the chat application.
//!
//! Settings are layered: built-in defaults, then an optional YAML file named
//! by `DIAL_CHAT_CONFIG`, then `DIAL_*` environment variables, then the
//! command line.

use std::path::Path;
use std::time::Duration;

use arrrg_derive::CommandLine;
use serde::Deserialize;

use crate::client::{DEFAULT_DEPLOYMENT, DEFAULT_ENDPOINT};
use crate::error::{Error, Result};

/// System prompt used when the user does not enter one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Environment variable naming a YAML configuration file.
pub const CONFIG_FILE_ENV: &str = "DIAL_CHAT_CONFIG";

/// Command-line arguments for the dial-chat tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// Wait for whole replies instead of streaming them.
    #[arrrg(flag, "Wait for whole replies instead of streaming them")]
    pub no_stream: bool,
}

/// How the assistant's replies are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// Stream fragments as they are generated.
    #[default]
    Streaming,

    /// Wait for the whole reply.
    Complete,
}

/// The shape of the optional YAML configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Base URL of the DIAL endpoint.
    pub endpoint: Option<String>,
    /// API key.
    pub api_key: Option<String>,
    /// Deployment to chat with.
    pub deployment: Option<String>,
    /// Dump requests and responses to stderr.
    pub log_requests: Option<bool>,
    /// HTTP timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// System prompt offered when the user enters none.
    pub system_prompt: Option<String>,
}

impl ConfigFile {
    /// Reads a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::io(format!("failed to read config {}", path.display()), err)
        })?;
        Self::from_yaml(&content)
    }

    /// Parses a configuration document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty mapping.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }
}

/// Configuration for a chat session.
///
/// This struct holds the resolved configuration values after layering the
/// config file, environment and command-line arguments over the defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// Base URL of the DIAL endpoint.
    pub endpoint: String,

    /// API key; `None` defers to `DIAL_API_KEY` when the client is built.
    pub api_key: Option<String>,

    /// Deployment to chat with.
    pub deployment: String,

    /// Whether replies are streamed.
    pub mode: ResponseMode,

    /// Whether the client logs requests and responses.
    pub log_requests: bool,

    /// Optional HTTP timeout; the client default applies otherwise.
    pub timeout: Option<Duration>,

    /// System prompt used when the user enters none.
    pub system_prompt: String,
}

impl ChatConfig {
    /// Creates a new ChatConfig with default values.
    ///
    /// Defaults:
    /// - Endpoint: https://ai-proxy.lab.epam.com
    /// - Deployment: gpt-4
    /// - Mode: streaming
    /// - Request logging: disabled
    pub fn new() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            deployment: DEFAULT_DEPLOYMENT.to_string(),
            mode: ResponseMode::Streaming,
            log_requests: false,
            timeout: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    /// Resolves the configuration from the process environment and `args`.
    pub fn load(args: ChatArgs) -> Result<Self> {
        let file = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.is_empty() => Some(ConfigFile::from_file(path)?),
            _ => None,
        };
        Self::resolve(file, |key| std::env::var(key).ok(), args)
    }

    /// Layers `file`, the variables visible through `env`, and `args` over
    /// the defaults.
    pub fn resolve(
        file: Option<ConfigFile>,
        env: impl Fn(&str) -> Option<String>,
        args: ChatArgs,
    ) -> Result<Self> {
        let mut config = Self::new();
        if let Some(file) = file {
            config.apply_file(file);
        }

        let env = |key: &str| env(key).filter(|value| !value.is_empty());
        if let Some(endpoint) = env("DIAL_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(api_key) = env("DIAL_API_KEY") {
            config.api_key = Some(api_key);
        }
        if let Some(deployment) = env("DIAL_DEPLOYMENT") {
            config.deployment = deployment;
        }
        if let Some(value) = env("DIAL_LOG_REQUESTS") {
            config.log_requests = parse_bool("DIAL_LOG_REQUESTS", &value)?;
        }
        if let Some(value) = env("DIAL_TIMEOUT_SECS") {
            let secs = value.parse::<u64>().map_err(|_| {
                Error::config(format!("DIAL_TIMEOUT_SECS must be a number, got {value:?}"))
            })?;
            config.timeout = Some(Duration::from_secs(secs));
        }

        if args.no_stream {
            config.mode = ResponseMode::Complete;
        }
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(endpoint) = file.endpoint {
            self.endpoint = endpoint;
        }
        if file.api_key.is_some() {
            self.api_key = file.api_key;
        }
        if let Some(deployment) = file.deployment {
            self.deployment = deployment;
        }
        if let Some(log_requests) = file.log_requests {
            self.log_requests = log_requests;
        }
        if let Some(secs) = file.timeout_secs {
            self.timeout = Some(Duration::from_secs(secs));
        }
        if let Some(system_prompt) = file.system_prompt {
            self.system_prompt = system_prompt;
        }
    }

    /// Sets the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the deployment.
    pub fn with_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = deployment.into();
        self
    }

    /// Sets the response mode.
    pub fn with_mode(mut self, mode: ResponseMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enables or disables request logging.
    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.log_requests = enabled;
        self
    }

    /// Sets the HTTP timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the default system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "{key} must be true or false, got {value:?}"
        ))),
    }
}
