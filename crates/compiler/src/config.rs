//! Compiler configuration.
//!
//! Carries the enabled `#version` identifiers, compile-time defines visible
//! to `#if`, and the target pointer width. A configuration can be built
//! programmatically or loaded from a TOML target manifest:
//!
//! ```toml
//! [target]
//! versions = ["linux"]
//! ptr_width = 8
//!
//! [defines]
//! DEBUG = 1
//! MAX_CLIENTS = 64
//! ```

use indexmap::IndexMap;
use serde::Deserialize;

/// Built-in `#version` identifiers, in mask-bit order. User-defined version
/// identifiers are rejected with a diagnostic.
pub const BUILTIN_VERSIONS: [&str; 3] = ["windows", "linux", "macos"];

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Bit mask over [`BUILTIN_VERSIONS`].
    pub enabled_versions: u32,
    /// Compile-time integer constants, registered as manifest constants in
    /// the root scope and therefore visible to `#if` conditions.
    pub defines: IndexMap<String, i64>,
    /// Pointer size in bytes. Only 8 is exercised by the current backends.
    pub ptr_width: u32,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            enabled_versions: 0,
            defines: IndexMap::new(),
            ptr_width: 8,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    target: ManifestTarget,
    #[serde(default)]
    defines: IndexMap<String, i64>,
}

#[derive(Debug, Deserialize, Default)]
struct ManifestTarget {
    #[serde(default)]
    versions: Vec<String>,
    ptr_width: Option<u32>,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    /// Enable a built-in version identifier (builder pattern).
    pub fn with_version(mut self, name: &str) -> Result<Self, String> {
        self.enable_version(name)?;
        Ok(self)
    }

    /// Add a compile-time define (builder pattern).
    pub fn with_define(mut self, name: impl Into<String>, value: i64) -> Self {
        self.defines.insert(name.into(), value);
        self
    }

    pub fn enable_version(&mut self, name: &str) -> Result<(), String> {
        match BUILTIN_VERSIONS.iter().position(|&v| v == name) {
            Some(bit) => {
                self.enabled_versions |= 1 << bit;
                Ok(())
            }
            None => Err(format!(
                "unknown version identifier '{}'. Built-in versions are: {}",
                name,
                BUILTIN_VERSIONS.join(", ")
            )),
        }
    }

    pub fn version_enabled(&self, bit_mask: u32) -> bool {
        self.enabled_versions & bit_mask != 0
    }

    /// Load a configuration from a TOML target manifest.
    pub fn from_toml(content: &str) -> Result<Self, String> {
        let manifest: Manifest =
            toml::from_str(content).map_err(|e| format!("invalid target manifest: {}", e))?;
        let mut config = CompilerConfig::new();
        for version in &manifest.target.versions {
            config.enable_version(version)?;
        }
        if let Some(width) = manifest.target.ptr_width {
            if width != 8 {
                return Err(format!("unsupported pointer width {} (expected 8)", width));
            }
            config.ptr_width = width;
        }
        config.defines = manifest.defines;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_builtin_version() {
        let config = CompilerConfig::new().with_version("linux").unwrap();
        assert_eq!(config.enabled_versions, 0b010);
        assert!(config.version_enabled(0b010));
        assert!(!config.version_enabled(0b001));
    }

    #[test]
    fn test_reject_unknown_version() {
        let err = CompilerConfig::new().with_version("beos").unwrap_err();
        assert!(err.contains("beos"));
        assert!(err.contains("windows"));
    }

    #[test]
    fn test_from_toml() {
        let config = CompilerConfig::from_toml(
            r#"
            [target]
            versions = ["windows", "macos"]
            ptr_width = 8

            [defines]
            DEBUG = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.enabled_versions, 0b101);
        assert_eq!(config.defines.get("DEBUG"), Some(&1));
    }

    #[test]
    fn test_from_toml_rejects_bad_version() {
        let err = CompilerConfig::from_toml("[target]\nversions = [\"amiga\"]\n").unwrap_err();
        assert!(err.contains("amiga"));
    }
}
