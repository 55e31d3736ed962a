use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::hasher::{MAX_CONCURRENT_LIMIT, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::core::models::TrustLevel;
use crate::core::mount::MountOptions;

pub const APP_NAME: &str = "usbwarden";
pub const SYSTEM_CONFIG: &str = "/etc/usbwarden/config.toml";
pub const ENV_PREFIX: &str = "USBWARDEN_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub auto_hash_on_connect: bool,
    pub auto_hash_on_eject: bool,
    pub require_confirmation_for_new: bool,
    pub require_confirmation_for_modified: bool,
    pub block_modified_devices: bool,
    /// 0 = new, 1 = trusted, 2 = always allow.
    pub default_trust_level: u8,
    pub hash_algorithm: String,
    pub hash_buffer_size_kb: usize,
    /// Map whole-file images into memory when hashing. Removable devices always
    /// use buffered reads: touching a mapped page after the stick is pulled
    /// raises SIGBUS instead of returning an I/O error.
    pub use_memory_mapping: bool,
    pub max_concurrent_hashes: usize,
    pub database_path: PathBuf,
    pub auto_save: bool,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub mount: MountConfig,
    pub notifications: NotificationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auto_hash_on_connect: true,
            auto_hash_on_eject: true,
            require_confirmation_for_new: true,
            require_confirmation_for_modified: true,
            block_modified_devices: false,
            default_trust_level: 0,
            hash_algorithm: "SHA256".to_string(),
            hash_buffer_size_kb: 1024,
            use_memory_mapping: true,
            max_concurrent_hashes: 1,
            database_path: default_database_path(),
            auto_save: true,
            simulation: false,
            verbose: false,
            json_logs: false,
            mount: MountConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub read_only: bool,
    pub sync: bool,
    pub extra_options: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Slack,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    pub slack_webhook: Option<String>,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

fn default_database_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("devices.json"))
        .unwrap_or_else(|| PathBuf::from("devices.json"))
}

pub fn user_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

impl AppConfig {
    /// Defaults, then system and user TOML files, then `USBWARDEN_*` variables,
    /// then whatever the CLI explicitly set.
    pub fn new<T: Serialize>(cli_overrides: Option<&T>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG));
        if let Some(user) = user_config_path() {
            figment = figment.merge(Toml::file(user));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        if let Some(overrides) = cli_overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }
        Self::from_figment(figment)
    }

    /// Load defaults overlaid with a single TOML file.
    pub fn from_file(path: &Path) -> Result<Self, figment::Error> {
        Self::from_figment(
            Figment::from(Serialized::defaults(AppConfig::default())).merge(Toml::file(path)),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self, figment::Error> {
        let config: AppConfig = figment.extract()?;
        Ok(config.normalize())
    }

    /// Clamp numeric settings into their supported ranges.
    pub fn normalize(mut self) -> Self {
        self.hash_buffer_size_kb = self
            .hash_buffer_size_kb
            .clamp(MIN_BUFFER_SIZE / 1024, MAX_BUFFER_SIZE / 1024);
        self.max_concurrent_hashes = self.max_concurrent_hashes.clamp(1, MAX_CONCURRENT_LIMIT);
        self.default_trust_level = self.default_trust_level.min(u8::from(TrustLevel::AlwaysAllow));
        if self.hash_algorithm.trim().is_empty() {
            self.hash_algorithm = "SHA256".to_string();
        }
        self
    }

    pub fn hash_buffer_size(&self) -> usize {
        self.hash_buffer_size_kb * 1024
    }

    pub fn default_trust(&self) -> TrustLevel {
        TrustLevel::from(self.default_trust_level)
    }

    pub fn mount_options(&self) -> MountOptions {
        MountOptions {
            read_only: self.mount.read_only,
            sync: self.mount.sync,
            extra_options: self.mount.extra_options.clone(),
            ..MountOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.auto_hash_on_connect);
        assert!(config.require_confirmation_for_new);
        assert!(!config.block_modified_devices);
        assert_eq!(config.hash_algorithm, "SHA256");
        assert_eq!(config.hash_buffer_size(), 1024 * 1024);
        assert_eq!(config.max_concurrent_hashes, 1);
        assert!(config.database_path.ends_with("devices.json"));
    }

    #[test]
    fn test_normalize_clamps_ranges() {
        let config = AppConfig {
            hash_buffer_size_kb: 1,
            max_concurrent_hashes: 32,
            default_trust_level: 9,
            hash_algorithm: "  ".into(),
            ..Default::default()
        }
        .normalize();
        assert_eq!(config.hash_buffer_size_kb, 64);
        assert_eq!(config.max_concurrent_hashes, 4);
        assert_eq!(config.default_trust(), TrustLevel::AlwaysAllow);
        assert_eq!(config.hash_algorithm, "SHA256");

        let big = AppConfig {
            hash_buffer_size_kb: 1 << 20,
            max_concurrent_hashes: 0,
            ..Default::default()
        }
        .normalize();
        assert_eq!(big.hash_buffer_size_kb, 16384);
        assert_eq!(big.max_concurrent_hashes, 1);
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
block_modified_devices = true
hash_algorithm = "BLAKE3"
max_concurrent_hashes = 2

[mount]
read_only = true
extra_options = ["uid=1000"]

[notifications]
channel = "slack"
slack_webhook = "https://hooks.example/abc"
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert!(config.block_modified_devices);
        assert_eq!(config.hash_algorithm, "BLAKE3");
        assert_eq!(config.max_concurrent_hashes, 2);
        assert_eq!(config.notifications.channel, NotificationChannelType::Slack);
        assert!(config.auto_hash_on_eject);

        let opts = config.mount_options();
        assert!(opts.read_only);
        assert_eq!(opts.option_string(), "ro,noexec,nosuid,uid=1000");
    }

    #[test]
    fn test_cli_overrides_win() {
        #[derive(Serialize)]
        struct Overrides {
            simulation: bool,
            database_path: PathBuf,
        }
        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string("simulation = false\nverbose = true"))
            .merge(Serialized::defaults(Overrides {
                simulation: true,
                database_path: PathBuf::from("/tmp/x.json"),
            }));

        let config = AppConfig::from_figment(figment).unwrap();
        assert!(config.simulation);
        assert!(config.verbose);
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.json"));
    }
}
