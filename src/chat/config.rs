//! Configuration for the `ask` front end.
//!
//! Values are layered, later sources winning: built-in defaults, then the
//! YAML file (`--config`, or `~/.ask/config.yaml` when it exists), then the
//! `ASK_*` environment variables, then command-line flags.

use std::env;
use std::path::{Path, PathBuf};

use arrrg_derive::CommandLine;
use serde::Deserialize;

use crate::client::{DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT, MessagesClient};
use crate::config::ConnectionPoolConfig;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;

/// Command-line arguments for the ask tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    #[arrrg(optional, "Model to use (default: claude-3-5-sonnet-20241022)", "MODEL")]
    pub model: Option<String>,

    #[arrrg(optional, "System prompt for the conversation", "PROMPT")]
    pub system: Option<String>,

    #[arrrg(optional, "Max tokens per response (default: 1024)", "TOKENS")]
    pub max_tokens: Option<u32>,

    #[arrrg(optional, "Configuration file (default: ~/.ask/config.yaml)", "PATH")]
    pub config: Option<String>,

    #[arrrg(flag, "Wait for whole answers instead of streaming")]
    pub no_stream: bool,
}

/// The YAML configuration file.  Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub stream: Option<bool>,
    pub pool: Option<ConnectionPoolConfig>,
}

impl ConfigFile {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::io(format!("failed to read {}", path.display()), e)
        })?;
        Self::from_yaml(&yaml)
    }
}

/// `~/.ask/config.yaml`, if a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    env::var_os("HOME").map(|home| PathBuf::from(home).join(".ask").join("config.yaml"))
}

/// Resolved settings for a chat session.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub stream: bool,
    pub pool: ConnectionPoolConfig,
}

impl ChatConfig {
    pub fn new() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            stream: true,
            pool: ConnectionPoolConfig::default(),
        }
    }

    /// Resolves `args` against the configuration file and the process
    /// environment.
    pub fn load(args: ChatArgs) -> Result<Self> {
        let file = match args.config.as_deref() {
            Some(path) => Some(ConfigFile::load(path)?),
            None => match default_config_path().filter(|path| path.exists()) {
                Some(path) => Some(ConfigFile::load(path)?),
                None => None,
            },
        };
        Self::resolve(args, file, |name| env::var(name).ok())
    }

    /// Layers `file`, then `env`, then `args` over the defaults.
    pub fn resolve(
        args: ChatArgs,
        file: Option<ConfigFile>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = Self::new();
        if let Some(file) = file {
            config.api_key = file.api_key.or(config.api_key);
            config.base_url = file.base_url.or(config.base_url);
            config.model = file.model.unwrap_or(config.model);
            config.system_prompt = file.system_prompt.unwrap_or(config.system_prompt);
            config.max_tokens = file.max_tokens.unwrap_or(config.max_tokens);
            config.stream = file.stream.unwrap_or(config.stream);
            config.pool = file.pool.unwrap_or(config.pool);
        }
        if let Some(key) = env("ASK_API_KEY") {
            config.api_key = Some(key);
        }
        if let Some(url) = env("ASK_BASE_URL") {
            config.base_url = Some(url);
        }
        if let Some(model) = env("ASK_MODEL") {
            config.model = model;
        }
        if let Some(model) = args.model {
            config.model = model;
        }
        if let Some(system) = args.system {
            config.system_prompt = system;
        }
        if let Some(max_tokens) = args.max_tokens {
            config.max_tokens = max_tokens;
        }
        if args.no_stream {
            config.stream = false;
        }
        if config.max_tokens == 0 {
            return Err(Error::config(
                "max_tokens must be positive",
                Some("max_tokens".to_string()),
            ));
        }
        config.pool.validate()?;
        Ok(config)
    }

    /// Builds a client over `pool` with these settings.
    pub fn client(&self, pool: ConnectionPool) -> Result<MessagesClient> {
        let mut client = MessagesClient::new(pool, self.api_key.clone())?
            .with_model(self.model.clone())
            .with_system_prompt(self.system_prompt.clone())
            .with_max_tokens(self.max_tokens);
        if let Some(base_url) = self.base_url.as_deref() {
            client = client.with_base_url(base_url)?;
        }
        Ok(client)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults() {
        let config = ChatConfig::resolve(ChatArgs::default(), None, no_env).unwrap();
        assert_eq!(config, ChatConfig::new());
        assert_eq!(config.model, "claude-3-5-sonnet-20241022");
        assert_eq!(config.max_tokens, 1024);
        assert!(config.stream);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn file_values_apply() {
        let file = ConfigFile::from_yaml(
            "model: claude-from-file\nmax_tokens: 256\nstream: false\npool:\n  max_connections: 4\n  max_connections_per_host: 2\n  timeout: 12.5\n",
        )
        .unwrap();
        let config = ChatConfig::resolve(ChatArgs::default(), Some(file), no_env).unwrap();
        assert_eq!(config.model, "claude-from-file");
        assert_eq!(config.max_tokens, 256);
        assert!(!config.stream);
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.pool.timeout, Duration::from_millis(12_500));
        assert_eq!(config.pool.max_retries, 3);
    }

    #[test]
    fn env_beats_file_and_flags_beat_env() {
        let file = ConfigFile {
            model: Some("file-model".to_string()),
            api_key: Some("file-key".to_string()),
            ..ConfigFile::default()
        };
        let env = |name: &str| match name {
            "ASK_MODEL" => Some("env-model".to_string()),
            "ASK_API_KEY" => Some("env-key".to_string()),
            "ASK_BASE_URL" => Some("http://localhost:9999/v1/".to_string()),
            _ => None,
        };
        let config = ChatConfig::resolve(ChatArgs::default(), Some(file.clone()), env).unwrap();
        assert_eq!(config.model, "env-model");
        assert_eq!(config.api_key.as_deref(), Some("env-key"));
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:9999/v1/"));

        let args = ChatArgs {
            model: Some("flag-model".to_string()),
            system: Some("Be terse.".to_string()),
            max_tokens: Some(99),
            config: None,
            no_stream: true,
        };
        let config = ChatConfig::resolve(args, Some(file), env).unwrap();
        assert_eq!(config.model, "flag-model");
        assert_eq!(config.system_prompt, "Be terse.");
        assert_eq!(config.max_tokens, 99);
        assert!(!config.stream);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let args = ChatArgs {
            max_tokens: Some(0),
            ..ChatArgs::default()
        };
        assert!(ChatConfig::resolve(args, None, no_env).unwrap_err().is_config());

        let file = ConfigFile::from_yaml("pool:\n  max_connections: 0\n").unwrap();
        assert!(ChatConfig::resolve(ChatArgs::default(), Some(file), no_env).is_err());
        assert!(ConfigFile::from_yaml("colour: blue\n").is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = ChatArgs {
            config: Some("/nonexistent/ask/config.yaml".to_string()),
            ..ChatArgs::default()
        };
        assert!(ChatConfig::load(args).is_err());
    }
}
