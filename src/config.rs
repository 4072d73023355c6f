//! Configuration for the compositor
//!
//! Loads configuration from TOML at `$DUALVIEW_CONFIG` or
//! `~/.config/dualview/config.toml`. Auto-generates the default file on
//! first run if missing.

use crate::layout::{Corner, Rotation, SmallWindow};
use anyhow::{Context, Result};
use dualview_ipc::TransportConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub display: DisplayConfig,
    pub layout: LayoutConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = dualview_ipc::config::config_path().context("Failed to get config directory")?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default()).context("Failed to serialize default config")?;
        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Software rasterizer, frames discarded. For testing without a display.
    Headless,
    /// Software rasterizer presenting to a Linux framebuffer device
    #[default]
    Fbdev,
    /// OpenGL in an X11 window
    Glx,
}

/// Display configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub backend: BackendKind,
    /// Physical panel rotation in degrees (0, 90, 180, 270)
    pub orientation: Rotation,
    /// Logical output size the layouts are drawn in
    pub output_width: u32,
    pub output_height: u32,
    pub fb_device: PathBuf,
    /// XRGB fill behind everything
    pub clear_color: u32,
    /// Sleep when no command is pending, in microseconds
    pub idle_sleep_us: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Fbdev,
            orientation: Rotation::R0,
            output_width: 640,
            output_height: 480,
            fb_device: PathBuf::from("/dev/fb0"),
            clear_color: 0x0000_0000,
            idle_sleep_us: 100,
        }
    }
}

impl DisplayConfig {
    /// Drawable size once the orientation is applied.
    pub fn physical_size(&self) -> (u32, u32) {
        if self.orientation.swaps_axes() {
            (self.output_height, self.output_width)
        } else {
            (self.output_width, self.output_height)
        }
    }
}

/// Small-window sub-mode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmallWindowConfig {
    /// Weight of the full-screen image, 0 (overlay opaque) to 9
    pub alpha: u8,
    pub border: bool,
    /// 0 = top-left, 1 = top-right, 2 = bottom-left, 3 = bottom-right
    pub position: u8,
}

impl Default for SmallWindowConfig {
    fn default() -> Self {
        Self {
            alpha: 0,
            border: true,
            position: 3,
        }
    }
}

impl SmallWindowConfig {
    pub fn resolve(&self) -> SmallWindow {
        let position = Corner::from_index(self.position).unwrap_or_else(|| {
            warn!("Small window position {} out of range, using bottom-right", self.position);
            Corner::BottomRight
        });
        if self.alpha > SmallWindow::MAX_ALPHA {
            warn!("Small window alpha {} clamped to {}", self.alpha, SmallWindow::MAX_ALPHA);
        }
        SmallWindow::new(position, self.alpha, self.border)
    }
}

/// Layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Layout mode id at startup
    pub mode: u8,
    /// Root of `<mode id>/` background image directories
    pub background_dir: Option<PathBuf>,
    /// Background image selected for the startup mode
    pub background_slot: usize,
    /// JSON file replacing the built-in layout table
    pub catalog: Option<PathBuf>,
    pub small_window: SmallWindowConfig,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            mode: 0,
            background_dir: None,
            background_slot: 0,
            catalog: None,
            small_window: SmallWindowConfig::default(),
        }
    }
}

impl LayoutConfig {
    /// Configured background root, else `~/.local/share/dualview/backgrounds`.
    pub fn background_root(&self) -> Option<PathBuf> {
        self.background_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("dualview").join("backgrounds")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [display]
            backend = "headless"
            orientation = 90

            [layout.small_window]
            alpha = 3
            position = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.display.backend, BackendKind::Headless);
        assert_eq!(config.display.physical_size(), (480, 640));
        assert_eq!(config.transport.poll_interval_us, 200);
        let sw = config.layout.small_window.resolve();
        assert_eq!(sw, SmallWindow::new(Corner::TopRight, 3, true));
    }

    #[test]
    fn test_default_roundtrips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let config: Config = toml::from_str(&text).unwrap();
        assert_eq!(config.display.output_width, 640);
        assert_eq!(config.layout.mode, 0);
    }

    #[test]
    fn test_bad_orientation_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[display]\norientation = 45\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_range_small_window_is_clamped() {
        let sw = SmallWindowConfig {
            alpha: 15,
            border: false,
            position: 9,
        }
        .resolve();
        assert_eq!(sw, SmallWindow::new(Corner::BottomRight, 9, false));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[layout]\nmode = 4\n").unwrap();
        assert_eq!(Config::load_from(&path).unwrap().layout.mode, 4);
    }
}
