//! Configuration management for jitter
//!
//! Stores settings in ~/.config/jitter/config.json; a `jitter.toml` in the
//! working directory overrides individual fields for one project.

use crate::keyring;
use crate::patch::Durability;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5:nitro";
pub const PROJECT_FILE: &str = "jitter.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Legacy plaintext key; migrated to the keychain on first use.
    pub openrouter_api_key: Option<String>,
    pub model: String,
    pub generator_timeout_secs: u64,
    pub max_chain_frames: usize,
    pub durability: Durability,
    /// Offer the generator before manual authoring.
    pub use_generator: bool,
    /// Authoring rounds allowed after a rejected candidate.
    pub max_attempts: u32,
    /// Turn empty manual input into a stub instead of a decline.
    pub default_stub_on_empty: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openrouter_api_key: None,
            model: DEFAULT_MODEL.to_string(),
            generator_timeout_secs: 60,
            max_chain_frames: crate::generate::MAX_CHAIN_FRAMES,
            durability: Durability::Ephemeral,
            use_generator: true,
            max_attempts: 5,
            default_stub_on_empty: false,
        }
    }
}

/// Project-level overrides; absent fields keep the user config value.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectOverrides {
    model: Option<String>,
    generator_timeout_secs: Option<u64>,
    max_chain_frames: Option<usize>,
    durability: Option<Durability>,
    use_generator: Option<bool>,
    max_attempts: Option<u32>,
    default_stub_on_empty: Option<bool>,
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("jitter"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// User config merged with `jitter.toml` from the current directory.
    pub fn load() -> Self {
        let base = Self::config_path()
            .map(|p| Self::load_from(&p))
            .unwrap_or_default();
        match std::env::current_dir() {
            Ok(dir) => base.with_project_overrides(&dir),
            Err(_) => base,
        }
    }

    /// Load a config file, or return defaults. A corrupt file is moved aside.
    pub fn load_from(path: &Path) -> Self {
        if let Ok(content) = fs::read_to_string(path) {
            match serde_json::from_str(&content) {
                Ok(config) => return config,
                Err(err) => {
                    preserve_corrupt_config(path, &content);
                    tracing::warn!(
                        path = %path.display(),
                        "config file was corrupted ({}); a backup was saved and defaults were loaded",
                        err
                    );
                }
            }
        }
        Self::default()
    }

    /// Apply `jitter.toml` from `dir`, if present and valid.
    pub fn with_project_overrides(mut self, dir: &Path) -> Self {
        let path = dir.join(PROJECT_FILE);
        let Ok(content) = fs::read_to_string(&path) else {
            return self;
        };
        let overrides: ProjectOverrides = match toml::from_str(&content) {
            Ok(o) => o,
            Err(err) => {
                tracing::warn!(path = %path.display(), "ignoring invalid project config: {}", err);
                return self;
            }
        };
        if let Some(v) = overrides.model {
            self.model = v;
        }
        if let Some(v) = overrides.generator_timeout_secs {
            self.generator_timeout_secs = v;
        }
        if let Some(v) = overrides.max_chain_frames {
            self.max_chain_frames = v;
        }
        if let Some(v) = overrides.durability {
            self.durability = v;
        }
        if let Some(v) = overrides.use_generator {
            self.use_generator = v;
        }
        if let Some(v) = overrides.max_attempts {
            self.max_attempts = v;
        }
        if let Some(v) = overrides.default_stub_on_empty {
            self.default_stub_on_empty = v;
        }
        self
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let path = Self::config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
        self.save_to(&path)
    }

    fn save_to(&self, path: &Path) -> Result<(), String> {
        let dir = path
            .parent()
            .ok_or_else(|| "Could not determine config directory".to_string())?;

        fs::create_dir_all(dir).map_err(|e| format!("Failed to create config directory: {}", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                tracing::warn!("failed to set config directory permissions: {}", e);
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))?;

        #[cfg(unix)]
        {
            write_config_atomic(path, &content).map_err(|e| format!("Failed to write config: {}", e))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))?;
        }

        Ok(())
    }

    /// Get the OpenRouter API key (environment, then keychain, then legacy field)
    pub fn get_api_key(&mut self) -> Option<String> {
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }

        match keyring::get_api_key() {
            Ok(Some(key)) => return Some(key),
            Ok(None) => {}
            Err(err) => keyring::warn_keychain_error_once("the OpenRouter key", &err),
        }

        if let Some(key) = self.openrouter_api_key.clone() {
            tracing::info!("migrating API key from config file to system keychain");
            match keyring::set_api_key(&key) {
                Ok(()) => {
                    if let Ok(Some(stored)) = keyring::get_api_key() {
                        if stored == key {
                            self.openrouter_api_key = None;
                            if let Err(err) = Self::clear_legacy_key() {
                                tracing::warn!("failed to remove plaintext API key from config: {}", err);
                            }
                        }
                    }
                }
                Err(err) => tracing::warn!("failed to migrate API key to keychain: {}", err),
            }
            return Some(key);
        }

        None
    }

    /// Store the API key in the keychain and drop any plaintext copy
    pub fn set_api_key(&mut self, key: &str) -> Result<(), String> {
        keyring::set_api_key(key).map_err(|err| {
            format!(
                "Failed to store API key in system keychain: {}. \
                 You can set the OPENROUTER_API_KEY environment variable instead.",
                err
            )
        })?;

        match keyring::get_api_key() {
            Ok(Some(stored)) if stored == key => {
                self.openrouter_api_key = None;
                Self::clear_legacy_key()
            }
            Ok(_) => Err("API key verification failed: the keychain did not return the stored key. \
                 You can set the OPENROUTER_API_KEY environment variable instead."
                .to_string()),
            Err(err) => Err(format!(
                "API key verification failed: couldn't read back from keychain ({}).",
                err
            )),
        }
    }

    /// Drop the plaintext key from the user config file only. `self` may carry
    /// project overrides that must not be written back.
    fn clear_legacy_key() -> Result<(), String> {
        let path = Self::config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
        Self::clear_legacy_key_at(&path)
    }

    fn clear_legacy_key_at(path: &Path) -> Result<(), String> {
        if !path.exists() {
            return Ok(());
        }
        let mut user = Self::load_from(path);
        user.openrouter_api_key = None;
        user.save_to(path)
    }

    /// Validate API key format (should start with sk-)
    pub fn validate_api_key_format(key: &str) -> bool {
        key.starts_with("sk-")
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/jitter/config.json".to_string())
    }
}

/// Interactive prompt to set up the API key
pub fn setup_api_key_interactive() -> Result<String, String> {
    use std::io;

    println!();
    println!("  ┌─────────────────────────────────────────────────────────┐");
    println!("  │  OPENROUTER SETUP                                       │");
    println!("  └─────────────────────────────────────────────────────────┘");
    println!();
    println!("  jitter asks OpenRouter to draft implementations for placeholder functions.");
    println!();
    println!("  1. Get an API key at: https://openrouter.ai/keys");
    println!("  2. Paste it below (saved in your system keychain)");
    println!();
    print!("  API Key: ");
    io::stdout().flush().map_err(|e| e.to_string())?;

    let mut key = String::new();
    io::stdin().read_line(&mut key).map_err(|e| e.to_string())?;
    let key = key.trim().to_string();

    if key.is_empty() {
        return Err("No API key provided".to_string());
    }

    if !Config::validate_api_key_format(&key) {
        println!();
        println!("  Warning: Key doesn't look like an OpenRouter key (should start with sk-)");
        println!("     Saving anyway...");
    }

    let mut config = Config::load();
    config.set_api_key(&key)?;

    println!();
    println!("  + API key saved. Settings live in {}", Config::config_location());
    println!();

    Ok(key)
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(unix)]
fn write_config_atomic(path: &Path, content: &str) -> Result<(), String> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::PermissionsExt;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
        tracing::warn!("failed to set temp config file permissions: {}", e);
    }

    file.write_all(content.as_bytes()).map_err(|e| e.to_string())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.openrouter_api_key.is_none());
        assert_eq!(config.generator_timeout_secs, 60);
        assert_eq!(config.max_chain_frames, 10);
        assert_eq!(config.durability, Durability::Ephemeral);
        assert_eq!(config.max_attempts, 5);
        assert!(config.use_generator);
        assert!(!config.default_stub_on_empty);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: Config = serde_json::from_str(r#"{"model": "x/y"}"#).unwrap();
        assert_eq!(config.model, "x/y");
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn test_corrupt_config_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let config = Config::load_from(&path);
        assert_eq!(config, Config::default());
        assert!(!path.exists());
        assert!(dir.path().join("config.json.corrupt").exists());
    }

    #[test]
    fn test_project_overrides() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(PROJECT_FILE),
            "durability = \"both\"\nmax_attempts = 2\nuse_generator = false\n",
        )
        .unwrap();
        let config = Config::default().with_project_overrides(dir.path());
        assert_eq!(config.durability, Durability::Both);
        assert_eq!(config.max_attempts, 2);
        assert!(!config.use_generator);
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_clearing_legacy_key_keeps_project_overrides_out() {
        let user_dir = tempfile::tempdir().unwrap();
        let path = user_dir.path().join("jitter").join("config.json");
        let user = Config {
            openrouter_api_key: Some("sk-legacy".to_string()),
            model: "user/model".to_string(),
            ..Config::default()
        };
        user.save_to(&path).unwrap();

        let project = tempfile::tempdir().unwrap();
        fs::write(project.path().join(PROJECT_FILE), "durability = \"both\"\nmax_attempts = 1\n").unwrap();
        let merged = Config::load_from(&path).with_project_overrides(project.path());
        assert_eq!(merged.durability, Durability::Both);

        Config::clear_legacy_key_at(&path).unwrap();
        let saved = Config::load_from(&path);
        assert!(saved.openrouter_api_key.is_none());
        assert_eq!(saved.model, "user/model");
        assert_eq!(saved.durability, Durability::Ephemeral);
        assert_eq!(saved.max_attempts, 5);
    }

    #[test]
    fn test_invalid_project_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PROJECT_FILE), "bogus_field = 1\n").unwrap();
        let config = Config::default().with_project_overrides(dir.path());
        assert_eq!(config, Config::default());
    }
}
