// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Vec3};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::context::{ContextSettings, SceneSettings};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub scene: SceneConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Photon".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// "auto" picks MAILBOX when available, FIFO otherwise.
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub ray_tracing: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "auto".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            ray_tracing: false,
        }
    }
}

/// Compiled SPIR-V locations, relative to the working directory
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/triangle.vert.spv"),
            fragment: PathBuf::from("shaders/triangle.frag.spv"),
        }
    }
}

/// Model loaded into the ray tracing scene
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub model: PathBuf,
    pub translation: [f32; 3],
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("models/sphere.obj"),
            translation: [0.0; 3],
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "photon.log".to_string(),
            show_fps: true,
        }
    }
}

pub const CONFIG_FILE: &str = "config.toml";

impl Config {
    /// Load configuration, falling back to defaults when the file is unusable.
    ///
    /// Runs before the logger exists, so the failure is handed back for the
    /// caller to report once logging is up.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path. A missing file yields defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Configured present mode preference, `None` for automatic selection
    pub fn present_mode(&self) -> Option<vk::PresentModeKHR> {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "auto" => None,
            "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
            "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
            "fifo" => Some(vk::PresentModeKHR::FIFO),
            "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
            _ => {
                log::warn!(
                    "Unknown present mode '{}', selecting automatically",
                    self.graphics.present_mode
                );
                None
            }
        }
    }

    /// Validation runs only in debug builds, and only when configured.
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }

    pub fn context_settings(&self) -> ContextSettings {
        ContextSettings {
            app_name: self.window.title.clone(),
            validation: self.validation_enabled(),
            ray_tracing: self.graphics.ray_tracing,
            present_mode: self.present_mode(),
            clear_color: self.graphics.clear_color,
            vertex_shader: self.shaders.vertex.clone(),
            fragment_shader: self.shaders.fragment.clone(),
            scene: self.graphics.ray_tracing.then(|| SceneSettings {
                model: self.scene.model.clone(),
                transform: Mat4::from_translation(Vec3::from(self.scene.translation)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.shaders.vertex, PathBuf::from("shaders/triangle.vert.spv"));
        assert_eq!(config.shaders.fragment, PathBuf::from("shaders/triangle.frag.spv"));
        assert!(!config.graphics.ray_tracing);
        assert_eq!(config.present_mode(), None);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: Config = toml::from_str(
            r#"
            [window]
            title = "Sandbox"

            [graphics]
            present_mode = "FIFO"
            ray_tracing = true

            [scene]
            model = "models/cube.obj"
            translation = [1.0, 0.0, -2.0]
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "Sandbox");
        assert_eq!(config.window.width, 1280);
        assert!(config.window.resizable);
        assert_eq!(config.present_mode(), Some(vk::PresentModeKHR::FIFO));
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);

        let settings = config.context_settings();
        assert!(settings.ray_tracing);
        let scene = settings.scene.unwrap();
        assert_eq!(scene.model, PathBuf::from("models/cube.obj"));
        assert_eq!(scene.transform.w_axis.truncate(), Vec3::new(1.0, 0.0, -2.0));
    }

    #[test]
    fn scene_is_skipped_without_ray_tracing() {
        let config = Config::default();
        assert!(config.context_settings().scene.is_none());
    }

    #[test]
    fn unknown_present_mode_falls_back_to_auto() {
        let mut config = Config::default();
        config.graphics.present_mode = "vsync-ish".to_string();
        assert_eq!(config.present_mode(), None);
        config.graphics.present_mode = "Mailbox".to_string();
        assert_eq!(config.present_mode(), Some(vk::PresentModeKHR::MAILBOX));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = Config::load_from_path("does/not/exist/config.toml").unwrap();
        assert_eq!(config.window.title, "Photon");
    }

    #[test]
    fn malformed_file_reports_path() {
        let path = std::env::temp_dir().join(format!("photon-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[window\nwidth = ").unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(format!("{err}").contains("Failed to parse config file"));
    }

    #[test]
    fn unusable_file_falls_back_with_reason() {
        let path = std::env::temp_dir().join(format!("photon-fallback-{}.toml", std::process::id()));
        std::fs::write(&path, "[window\nwidth = ").unwrap();

        let (config, failure) = Config::load_or_default(&path);
        std::fs::remove_file(&path).ok();

        assert_eq!(config.window.width, 1280);
        let failure = failure.map(|e| format!("{e:#}")).unwrap_or_default();
        assert!(failure.contains("Failed to parse config file"));
    }

    #[test]
    fn missing_file_reports_no_failure() {
        let (config, failure) = Config::load_or_default("does/not/exist/config.toml");
        assert!(failure.is_none());
        assert_eq!(config.window.title, "Photon");
    }
}
