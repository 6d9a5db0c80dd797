//! Shader module factory.
//!
//! A shader is requested by stage, source path (relative to the shader
//! directory), preprocessor defines and specialization constants. Each define
//! combination is a separate SPIR-V variant named
//! `<source>.<KEY>-<VALUE>...spv`, compiled with glslangValidator on demand
//! and cached on disk. Sources that are not shipped fall back to a
//! precompiled variant next to where the source would be.

use ash::vk;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// The SPIR-V magic number (little-endian).
const SPIRV_MAGIC: u32 = 0x07230203;

/// A preprocessor define passed as `-D<key>=<value>`.
pub type ShaderDefine = (&'static str, u32);

// ===========================================================================
// Specialization constants
// ===========================================================================

/// Consecutive 4-byte specialization constants with ids 0..n.
#[derive(Clone, Debug, Default)]
pub struct SpecializationConstants {
    data: Vec<u8>,
    entries: Vec<vk::SpecializationMapEntry>,
}

impl SpecializationConstants {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_word(mut self, bytes: [u8; 4]) -> Self {
        let id = self.entries.len() as u32;
        self.entries.push(vk::SpecializationMapEntry {
            constant_id: id,
            offset: self.data.len() as u32,
            size: 4,
        });
        self.data.extend_from_slice(&bytes);
        self
    }

    pub fn with_u32(self, value: u32) -> Self {
        self.push_word(value.to_ne_bytes())
    }

    pub fn with_f32(self, value: f32) -> Self {
        self.push_word(value.to_ne_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[vk::SpecializationMapEntry] {
        &self.entries
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn info(&self) -> vk::SpecializationInfo<'_> {
        vk::SpecializationInfo::default()
            .map_entries(&self.entries)
            .data(&self.data)
    }
}

/// A compiled module plus what pipeline creation needs to consume it.
pub struct ShaderModule {
    pub module: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
    pub specialization: SpecializationConstants,
}

// ===========================================================================
// Variant naming
// ===========================================================================

/// File name of the SPIR-V variant of `source` for `defines`.
///
/// Defines are sorted by key so the name does not depend on call-site order.
pub fn variant_file_name(source: &Path, defines: &[ShaderDefine]) -> String {
    let base = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut sorted = defines.to_vec();
    sorted.sort_by_key(|(key, _)| *key);

    let mut name = base;
    for (key, value) in sorted {
        name.push_str(&format!(".{}-{}", key, value));
    }
    name.push_str(".spv");
    name
}

/// Arguments for compiling `source` into `output` with glslangValidator.
pub fn glslang_args(source: &Path, output: &Path, defines: &[ShaderDefine]) -> Vec<String> {
    let mut args = vec!["-V".to_string()];
    args.extend(defines.iter().map(|(key, value)| format!("-D{}={}", key, value)));
    args.push(source.to_string_lossy().into_owned());
    args.push("-o".to_string());
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Detect the shader stage from a source or SPIR-V file name.
pub fn detect_stage(filename: &str) -> Result<vk::ShaderStageFlags, String> {
    let lower = Path::new(filename)
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let stem = lower.split('.').nth(1).unwrap_or("");
    match stem {
        "vert" => Ok(vk::ShaderStageFlags::VERTEX),
        "frag" => Ok(vk::ShaderStageFlags::FRAGMENT),
        "comp" => Ok(vk::ShaderStageFlags::COMPUTE),
        "rgen" => Ok(vk::ShaderStageFlags::RAYGEN_KHR),
        "rchit" => Ok(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        "rmiss" => Ok(vk::ShaderStageFlags::MISS_KHR),
        _ => Err(format!("Cannot detect shader stage from filename: {}", filename)),
    }
}

/// Reinterpret SPIR-V bytes as words, validating size and magic number.
pub fn spirv_words(bytes: &[u8], origin: &Path) -> Result<Vec<u32>, String> {
    if bytes.len() < 4 {
        return Err(format!("{:?}: file too small to be valid SPIR-V", origin));
    }

    if bytes.len() % 4 != 0 {
        return Err(format!(
            "{:?}: file size {} is not a multiple of 4",
            origin,
            bytes.len()
        ));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(format!(
            "{:?}: bad SPIR-V magic 0x{:08X} (expected 0x{:08X})",
            origin, words[0], SPIRV_MAGIC
        ));
    }

    Ok(words)
}

pub fn load_spirv(path: &Path) -> Result<Vec<u32>, String> {
    let bytes = fs::read(path).map_err(|e| format!("Failed to read {:?}: {}", path, e))?;
    spirv_words(&bytes, path)
}

fn is_newer_or_equal(candidate: &Path, reference: &Path) -> bool {
    let modified = |path: &Path| fs::metadata(path).and_then(|meta| meta.modified()).ok();
    match (modified(candidate), modified(reference)) {
        (Some(candidate), Some(reference)) => candidate >= reference,
        _ => false,
    }
}

// ===========================================================================
// ShaderManager
// ===========================================================================

pub struct ShaderManager {
    device: ash::Device,
    shader_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ShaderManager {
    pub fn new(device: ash::Device, shader_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            device,
            shader_dir,
            cache_dir,
        }
    }

    /// Locate or build the SPIR-V for a variant and return its path.
    fn resolve_variant(&self, path: &str, defines: &[ShaderDefine]) -> Result<PathBuf, String> {
        let source = self.shader_dir.join(path);
        let file_name = variant_file_name(&source, defines);

        if !source.exists() {
            let precompiled = source.with_file_name(&file_name);
            if precompiled.exists() {
                return Ok(precompiled);
            }
            return Err(format!(
                "Shader source {:?} not found and no precompiled {:?}",
                source, precompiled
            ));
        }

        let cached = self.cache_dir.join(&file_name);
        if is_newer_or_equal(&cached, &source) {
            return Ok(cached);
        }

        fs::create_dir_all(&self.cache_dir).map_err(|e| {
            format!("Failed to create shader cache {:?}: {}", self.cache_dir, e)
        })?;

        let args = glslang_args(&source, &cached, defines);
        let output = Command::new("glslangValidator")
            .args(&args)
            .output()
            .map_err(|e| {
                format!(
                    "Failed to run glslangValidator for {:?} (is it on PATH?): {}",
                    source, e
                )
            })?;

        if !output.status.success() {
            return Err(format!(
                "glslangValidator failed to compile {:?}:\n{}{}",
                source,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        info!("Compiled shader variant {}", file_name);
        Ok(cached)
    }

    /// Create a module for `stage` from the variant of `path` selected by `defines`.
    pub fn create_shader_module(
        &self,
        stage: vk::ShaderStageFlags,
        path: &str,
        defines: &[ShaderDefine],
        specialization: SpecializationConstants,
    ) -> Result<ShaderModule, String> {
        let detected = detect_stage(path)?;
        if detected != stage {
            return Err(format!(
                "Shader {} is a {:?} shader, requested as {:?}",
                path, detected, stage
            ));
        }

        let spirv_path = self.resolve_variant(path, defines)?;
        let code = load_spirv(&spirv_path)?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe {
            self.device
                .create_shader_module(&create_info, None)
                .map_err(|e| format!("Failed to create shader module {}: {:?}", path, e))?
        };

        debug!("Created shader module from {:?}", spirv_path);
        Ok(ShaderModule {
            module,
            stage,
            specialization,
        })
    }

    pub fn destroy_shader_module(&self, shader: ShaderModule) {
        unsafe { self.device.destroy_shader_module(shader.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_name_without_defines_is_plain_spirv() {
        assert_eq!(
            variant_file_name(Path::new("shaders/Compute/Lighting.comp"), &[]),
            "Lighting.comp.spv"
        );
    }

    #[test]
    fn variant_name_sorts_defines() {
        let a = variant_file_name(
            Path::new("Lighting.comp"),
            &[("RAY_TRACING_ENABLED", 1), ("LIGHT_COUNT", 4)],
        );
        let b = variant_file_name(
            Path::new("Lighting.comp"),
            &[("LIGHT_COUNT", 4), ("RAY_TRACING_ENABLED", 1)],
        );
        assert_eq!(a, "Lighting.comp.LIGHT_COUNT-4.RAY_TRACING_ENABLED-1.spv");
        assert_eq!(a, b);
    }

    #[test]
    fn glslang_args_carry_defines() {
        let args = glslang_args(
            Path::new("in.comp"),
            Path::new("out.spv"),
            &[("LIGHT_COUNT", 2)],
        );
        assert_eq!(args, vec!["-V", "-DLIGHT_COUNT=2", "in.comp", "-o", "out.spv"]);
    }

    #[test]
    fn stage_is_detected_from_source_and_variant_names() {
        assert_eq!(detect_stage("Lighting.comp"), Ok(vk::ShaderStageFlags::COMPUTE));
        assert_eq!(
            detect_stage("GBuffer.frag.MATERIAL_COUNT-3.spv"),
            Ok(vk::ShaderStageFlags::FRAGMENT)
        );
        assert_eq!(detect_stage("Forward.vert.spv"), Ok(vk::ShaderStageFlags::VERTEX));
        assert!(detect_stage("README.md").is_err());
    }

    #[test]
    fn specialization_entries_are_consecutive_words() {
        let constants = SpecializationConstants::new()
            .with_u32(8)
            .with_u32(8)
            .with_f32(100.0);

        let entries = constants.entries();
        assert_eq!(entries.len(), 3);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.constant_id, i as u32);
            assert_eq!(entry.offset, 4 * i as u32);
            assert_eq!(entry.size, 4);
        }
        assert_eq!(constants.data().len(), 12);
        assert_eq!(&constants.data()[8..], &100.0f32.to_ne_bytes());
    }

    #[test]
    fn spirv_magic_is_validated() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 1, 0]);
        assert_eq!(spirv_words(&bytes, Path::new("ok.spv")).unwrap().len(), 2);

        assert!(spirv_words(&[1, 2, 3], Path::new("short.spv")).is_err());
        assert!(spirv_words(&[0, 0, 0, 0, 0], Path::new("odd.spv")).is_err());
        assert!(spirv_words(&[0, 0, 0, 0], Path::new("magic.spv")).is_err());
    }
}
