//! Renderer configuration loaded from `renderer.toml`.
//!
//! Every field has a default, so a partial file (or no file at all) is
//! valid. Unknown keys are ignored.
//!
//! ```toml
//! [window]
//! width = 1600
//! height = 900
//!
//! [render]
//! prefer_ray_tracing = false
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// File name looked up in the working directory by [`RendererConfig::load_or_default`].
pub const CONFIG_FILE_NAME: &str = "renderer.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Window settings.
    pub window: WindowConfig,
    /// Device and back-end settings.
    pub render: RenderConfig,
    /// Asset and shader locations.
    pub assets: AssetConfig,
}

/// Window settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Initial client width in pixels.
    pub width: u32,
    /// Initial client height in pixels.
    pub height: u32,
    /// Title prefix; the frame loop appends mode, size and frame rate.
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "Vulkan Renderer".to_string(),
        }
    }
}

/// Device and back-end settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Enable the Khronos validation layer when installed.
    pub enable_validation: bool,
    /// Start in the ray-tracing back end when the device supports it.
    pub prefer_ray_tracing: bool,
    /// Present with FIFO (vsync) instead of MAILBOX.
    pub vsync: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            enable_validation: cfg!(debug_assertions),
            prefer_ray_tracing: true,
            vsync: false,
        }
    }
}

/// Asset and shader locations, relative to the working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// glTF mesh; a procedural cube is used when it does not exist.
    pub mesh: PathBuf,
    /// Texture image; a procedural checkerboard is used when it does not exist.
    pub texture: PathBuf,
    /// Directory holding the compiled `*.spv` shaders.
    pub shader_dir: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            mesh: PathBuf::from("assets/models/mesh.gltf"),
            texture: PathBuf::from("assets/textures/texture.png"),
            shader_dir: PathBuf::from("shaders/spirv"),
        }
    }
}

impl RendererConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the text is not valid TOML or a value has
    /// the wrong type.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and [`Error::Config`]
    /// if it cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise returns the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error only if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("{} not found, using default configuration", path.display());
            Ok(Self::default())
        }
    }

    /// Serializes the configuration back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = RendererConfig::from_toml_str("").unwrap();
        assert_eq!(config, RendererConfig::default());
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert!(config.render.prefer_ray_tracing);
        assert_eq!(config.assets.shader_dir, PathBuf::from("shaders/spirv"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = RendererConfig::from_toml_str(
            r#"
            [window]
            width = 1600

            [render]
            prefer_ray_tracing = false
            "#,
        )
        .unwrap();
        assert_eq!(config.window.width, 1600);
        assert_eq!(config.window.height, 720);
        assert!(!config.render.prefer_ray_tracing);
        assert_eq!(config.assets, AssetConfig::default());
    }

    #[test]
    fn test_wrong_type_is_config_error() {
        let result = RendererConfig::from_toml_str("[window]\nwidth = \"wide\"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = Path::new("definitely/not/here/renderer.toml");
        let config = RendererConfig::load_or_default(path).unwrap();
        assert_eq!(config, RendererConfig::default());
    }

    #[test]
    fn test_serialized_config_parses_back() {
        let mut config = RendererConfig::default();
        config.window.title = "Test".to_string();
        config.render.vsync = true;
        let text = config.to_toml_string().unwrap();
        assert_eq!(RendererConfig::from_toml_str(&text).unwrap(), config);
    }
}
