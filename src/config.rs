//! Configuration
//!
//! Read from `~/.config/relayterm/config.toml` (or `--config PATH`). Every
//! section and field is optional; missing values fall back to the defaults
//! below.
//!
//! ```toml
//! flavor = "centos"
//! user = "root"
//! host = "db-01"
//!
//! [transport]
//! shell = ["ssh", "-tt", "root@db-01"]
//! exec = ["ssh", "root@db-01"]
//!
//! [dispatch]
//! interrupt_command = "^C"
//! refresh_delay_ms = 300
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::shell::completer::DEFAULT_COMMANDS;
use crate::shell::dispatch::DispatchSettings;
use crate::shell::history::DEFAULT_MAX_ENTRIES;
use crate::shell::passthrough::PROMPT_MARKER_SETUP;
use crate::shell::prompt::SystemFlavor;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub flavor: SystemFlavor,
    /// Remote user shown in the prompt.
    pub user: String,
    /// Remote host shown in the prompt.
    pub host: String,
    pub transport: TransportConfig,
    pub prompt: PromptConfig,
    pub dispatch: DispatchSettings,
    pub completion: CompletionConfig,
    pub history: HistoryConfig,
    pub transfer: TransferConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flavor: SystemFlavor::default(),
            user: std::env::var("USER").unwrap_or_else(|_| "user".to_string()),
            host: "localhost".to_string(),
            transport: TransportConfig::default(),
            prompt: PromptConfig::default(),
            dispatch: DispatchSettings::default(),
            completion: CompletionConfig::default(),
            history: HistoryConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

/// Commands that open the remote shell and run one-off commands.
/// `exec` gets the command line appended as its last argument.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub shell: Vec<String>,
    pub exec: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            shell: vec!["sh".to_string(), "-i".to_string()],
            exec: vec!["sh".to_string(), "-c".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Wait for the remote prompt marker before drawing the local prompt.
    pub marker: bool,
    /// Sent once when the shell opens so the remote prompt prints the marker.
    pub setup: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            marker: true,
            setup: PROMPT_MARKER_SETUP.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub commands: Vec<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            commands: DEFAULT_COMMANDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// History file; `None` keeps history in memory only.
    pub file: Option<PathBuf>,
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            file: dirs::home_dir().map(|h| h.join(".relayterm_history")),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Minimum time between progress updates.
    pub progress_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            progress_interval_ms: 250,
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("relayterm").join("config.toml"))
    }

    /// Loads `path`, or the default location when `None`. A missing default
    /// file is not an error; a missing explicit one is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if !explicit && err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        Self::parse(&text, &path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Points the transport at `target` (`[user@]host`) over ssh.
    pub fn connect_to(&mut self, target: &str) {
        let (user, host) = match target.split_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, target),
        };
        if let Some(user) = user {
            self.user = user.to_string();
        }
        self.host = host.to_string();
        self.transport.shell = vec![
            "ssh".to_string(),
            "-tt".to_string(),
            target.to_string(),
        ];
        self.transport.exec = vec!["ssh".to_string(), target.to_string()];
    }
}
