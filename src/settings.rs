//! Process-wide settings, loaded once and immutable afterwards

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Library version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pagerast";

pub const MAX_ANTI_ALIAS_LEVEL: i32 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Per-document native store budget used when a caller passes 0
    #[serde(default = "default_max_store_mb")]
    pub max_store_mb: u32,

    #[serde(default = "default_anti_alias_level")]
    pub anti_alias_level: i32,

    #[serde(default = "default_tile_size")]
    pub tile_width: u32,

    #[serde(default = "default_tile_size")]
    pub tile_height: u32,

    /// Rendered tiles kept alive while panning with `TileCache::render_visible`
    #[serde(default = "default_max_resident_tiles")]
    pub max_resident_tiles: usize,

    #[serde(default = "default_worker_thread_name")]
    pub worker_thread_name: String,

    /// Prefix of temporary files backing in-memory documents
    #[serde(default = "default_temp_prefix")]
    pub temp_prefix: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_max_store_mb() -> u32 {
    60
}

fn default_anti_alias_level() -> i32 {
    MAX_ANTI_ALIAS_LEVEL
}

fn default_tile_size() -> u32 {
    512
}

fn default_max_resident_tiles() -> usize {
    64
}

fn default_worker_thread_name() -> String {
    "pagerast-render".to_string()
}

fn default_temp_prefix() -> String {
    "pagerast".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_store_mb: default_max_store_mb(),
            anti_alias_level: default_anti_alias_level(),
            tile_width: default_tile_size(),
            tile_height: default_tile_size(),
            max_resident_tiles: default_max_resident_tiles(),
            worker_thread_name: default_worker_thread_name(),
            temp_prefix: default_temp_prefix(),
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Clamp out-of-range values back into their valid ranges
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if self.max_store_mb == 0 {
            self.max_store_mb = default_max_store_mb();
        }
        self.anti_alias_level = self.anti_alias_level.clamp(0, MAX_ANTI_ALIAS_LEVEL);
        self.tile_width = self.tile_width.max(1);
        self.tile_height = self.tile_height.max(1);
        self.max_resident_tiles = self.max_resident_tiles.max(1);
        if self.worker_thread_name.is_empty() {
            self.worker_thread_name = default_worker_thread_name();
        }
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing settings: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Default location, `<config dir>/pagerast/config.yaml`
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

pub fn parse_settings(yaml: &str) -> Result<Settings, SettingsError> {
    Ok(serde_yaml::from_str::<Settings>(yaml)?.sanitized())
}

pub fn read_settings(path: &Path) -> Result<Settings, SettingsError> {
    let content = fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_settings(&content)
}

fn load_default_location() -> Settings {
    let Some(path) = config_path().filter(|p| p.exists()) else {
        debug!("No settings file, using defaults");
        return Settings::default();
    };
    match read_settings(&path) {
        Ok(settings) => {
            debug!("Loaded settings from {path:?}");
            settings
        }
        Err(e) => {
            error!("Failed to load settings from {path:?}: {e}");
            Settings::default()
        }
    }
}

/// Current settings; the first call loads them from the default location.
pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(load_default_location)
}

/// Install settings before first use. Rejected once settings are in place.
pub fn install(settings: Settings) -> Result<(), Settings> {
    SETTINGS.set(settings.sanitized()).inspect_err(|_| {
        warn!("Settings already initialized, ignoring install");
    })
}

#[must_use]
pub fn version() -> &'static str {
    VERSION
}
