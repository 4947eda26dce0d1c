// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Loads renderer configuration from config.toml. Every section falls back to
// defaults when missing, and a broken file falls back as a whole.

use crate::backend::{DispMethod, HeadlessPlatform};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub interop: InteropConfig,
    /// Capabilities of the simulated platform when `graphics.backend` is
    /// `"headless"`.
    pub headless: HeadlessPlatform,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "emu-gfx".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub backend: DispMethod,
    /// Ask for a tear-capable surface when the platform offers one.
    pub allow_tearing: bool,
    pub vsync: bool,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: DispMethod::Vulkan,
            allow_tearing: true,
            vsync: true,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    /// env_logger filter used when RUST_LOG is unset.
    pub log_filter: String,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_filter: "info".to_string(),
            log_to_file: false,
            log_file: "emu_gfx.log".to_string(),
            show_fps: true,
        }
    }
}

/// Texture sharing with a secondary GPU context
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InteropConfig {
    pub enabled: bool,
}

impl Default for InteropConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.graphics.backend, DispMethod::Vulkan);
        assert!(config.graphics.allow_tearing);
        assert!(config.interop.enabled);
        assert_eq!(config.headless, HeadlessPlatform::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [graphics]
            backend = "headless"
            vsync = false

            [headless]
            flip_presentation = false
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.backend, DispMethod::Headless);
        assert!(!config.graphics.vsync);
        assert!(config.graphics.allow_tearing);
        assert!(!config.headless.flip_presentation);
        assert!(config.headless.supported);
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn unknown_backend_is_an_error() {
        assert!(Config::from_toml("[graphics]\nbackend = \"metal\"\n").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.window.title, "emu-gfx");
    }
}
