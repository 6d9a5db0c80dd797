//! Renderer configuration loaded from an optional JSON file.
//!
//! Every field has a default so a missing file or a partial file is valid.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Requested ray tracing path. Only honored if the device supports it.
    pub ray_tracing_enabled: bool,
    /// Swap near/far in projection matrices and clear depth to 0.
    pub reverse_depth: bool,
    /// Clamp applied to environment samples while prefiltering reflections.
    pub max_environment_luminance: f32,
    pub shader_dir: PathBuf,
    pub shader_cache_dir: PathBuf,
    pub frames_in_flight: u32,
    /// Whether the demo scene carries a light volume.
    pub light_volume: bool,
    /// Face size of the procedural environment cubemap.
    pub environment_extent: u32,
    /// Derive the demo sun from the brightest region of the environment
    /// instead of placing it by hand.
    pub environment_direct_light: bool,
    /// Colour each mip level of material textures to visualise LOD selection.
    pub debug_mip_colors: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            ray_tracing_enabled: true,
            reverse_depth: false,
            max_environment_luminance: 100.0,
            shader_dir: PathBuf::from("shaders"),
            shader_cache_dir: PathBuf::from("target/shader-cache"),
            frames_in_flight: 2,
            light_volume: true,
            environment_extent: 512,
            environment_direct_light: true,
            debug_mip_colors: false,
        }
    }
}

impl RenderConfig {
    /// Load a config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        Self::from_json(&content)
            .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let config: RenderConfig = serde_json::from_str(content)?;
        Ok(config.sanitized())
    }

    fn sanitized(mut self) -> Self {
        self.frames_in_flight = self.frames_in_flight.max(1);
        self.environment_extent = self.environment_extent.max(1);
        self
    }

    /// Clear value for depth attachments under the configured depth convention.
    pub fn depth_clear_value(&self) -> f32 {
        if self.reverse_depth {
            0.0
        } else {
            1.0
        }
    }

    pub fn depth_compare_op(&self) -> ash::vk::CompareOp {
        if self.reverse_depth {
            ash::vk::CompareOp::GREATER_OR_EQUAL
        } else {
            ash::vk::CompareOp::LESS_OR_EQUAL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = RenderConfig::from_json("{}").unwrap();
        assert!(config.ray_tracing_enabled);
        assert!(!config.reverse_depth);
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.shader_dir, PathBuf::from("shaders"));
        assert_eq!(config.environment_extent, 512);
        assert!(!config.debug_mip_colors);
        assert!(config.environment_direct_light);
    }

    #[test]
    fn partial_config_overrides_fields() {
        let config =
            RenderConfig::from_json(r#"{ "ray_tracing_enabled": false, "reverse_depth": true }"#)
                .unwrap();
        assert!(!config.ray_tracing_enabled);
        assert!(config.reverse_depth);
        assert_eq!(config.depth_clear_value(), 0.0);
        assert_eq!(config.depth_compare_op(), ash::vk::CompareOp::GREATER_OR_EQUAL);
        assert_eq!(config.max_environment_luminance, 100.0);
    }

    #[test]
    fn zero_frames_in_flight_is_clamped() {
        let config = RenderConfig::from_json(r#"{ "frames_in_flight": 0 }"#).unwrap();
        assert_eq!(config.frames_in_flight, 1);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(RenderConfig::from_json("{ not json").is_err());
    }
}
