use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// The configuration contract the external loader (config files, env,
/// CLI overlay — all out of scope here) is expected to fill in. This crate
/// only ships a default-valued snapshot so the binary can run standalone.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// User ids permitted to join a room as a monitor/spectator.
    pub monitors: Vec<i32>,
    /// Default max players per room, clamped to `1..=64`.
    pub room_max_users: usize,
    /// Initial value of the server-wide replay toggle.
    pub replay_enabled: bool,
    /// Initial value of the server-wide room creation toggle.
    pub room_creation_enabled: bool,
    pub server_name: String,
    pub room_list_tip: String,
    /// Base URL of the upstream identity service (`/me`, `/chart/{id}`,
    /// `/record/{id}`, and the decorative quote endpoint).
    pub identity_host: String,
    /// Root directory replay files are written under.
    pub replay_base_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitors: Vec::new(),
            room_max_users: 8,
            replay_enabled: true,
            room_creation_enabled: true,
            server_name: "rhymux".to_owned(),
            room_list_tip: String::new(),
            identity_host: "https://id.example.invalid".to_owned(),
            replay_base_dir: PathBuf::from("replays"),
        }
    }
}

impl Config {
    /// Clamp `room_max_users` into the permitted `[1, 64]` range.
    pub fn clamped_room_max_users(&self) -> usize {
        self.room_max_users.clamp(1, 64)
    }

    /// Load a snapshot from a YAML file, falling back to defaults for any
    /// field it doesn't set. A missing file is not an error: it just means
    /// running with all defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_max_users_is_clamped() {
        let mut config = Config::default();
        config.room_max_users = 0;
        assert_eq!(config.clamped_room_max_users(), 1);
        config.room_max_users = 1000;
        assert_eq!(config.clamped_room_max_users(), 64);
        config.room_max_users = 12;
        assert_eq!(config.clamped_room_max_users(), 12);
    }
}
