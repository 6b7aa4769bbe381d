//! Mirroring plugin configuration.

use std::fmt;

use cfgrepo_meta::Author;
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

/// Default size of the mirroring worker pool.
pub const DEFAULT_NUM_MIRRORING_THREADS: usize = 16;
/// Default maximum number of files transferred by one mirror pass.
pub const DEFAULT_MAX_NUM_FILES_PER_MIRROR: usize = 8192;
/// Default maximum number of bytes transferred by one mirror pass.
pub const DEFAULT_MAX_NUM_BYTES_PER_MIRROR: u64 = 32 * 1024 * 1024;

fn default_enabled() -> bool {
    true
}

fn default_num_mirroring_threads() -> usize {
    DEFAULT_NUM_MIRRORING_THREADS
}

fn default_max_num_files_per_mirror() -> usize {
    DEFAULT_MAX_NUM_FILES_PER_MIRROR
}

fn default_max_num_bytes_per_mirror() -> u64 {
    DEFAULT_MAX_NUM_BYTES_PER_MIRROR
}

/// Settings of the mirroring service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroringServicePluginConfig {
    /// Whether mirror passes run at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Maximum number of mirrors synchronised at once.
    #[serde(default = "default_num_mirroring_threads")]
    pub num_mirroring_threads: usize,
    /// Maximum number of files one mirror may transfer.
    #[serde(default = "default_max_num_files_per_mirror")]
    pub max_num_files_per_mirror: usize,
    /// Maximum number of bytes one mirror may transfer.
    #[serde(default = "default_max_num_bytes_per_mirror")]
    pub max_num_bytes_per_mirror: u64,
    /// Run each mirror only on nodes of its configured zone.
    #[serde(default)]
    pub zone_pinned: bool,
    /// Author of mirror commits when a mirror names none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mirror_author: Option<Author>,
}

impl Default for MirroringServicePluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num_mirroring_threads: DEFAULT_NUM_MIRRORING_THREADS,
            max_num_files_per_mirror: DEFAULT_MAX_NUM_FILES_PER_MIRROR,
            max_num_bytes_per_mirror: DEFAULT_MAX_NUM_BYTES_PER_MIRROR,
            zone_pinned: false,
            default_mirror_author: None,
        }
    }
}

impl MirroringServicePluginConfig {
    /// Builds a configuration from explicit values.
    pub fn new(
        enabled: bool,
        num_mirroring_threads: usize,
        max_num_files_per_mirror: usize,
        max_num_bytes_per_mirror: u64,
        zone_pinned: bool,
        default_mirror_author: Option<Author>,
    ) -> Self {
        Self {
            enabled,
            num_mirroring_threads,
            max_num_files_per_mirror,
            max_num_bytes_per_mirror,
            zone_pinned,
            default_mirror_author,
        }
    }

    /// Rejects limits that would stop every mirror from running.
    pub fn validate(&self) -> Result<(), MirrorError> {
        if self.num_mirroring_threads == 0 {
            return Err(MirrorError::InvalidConfig(
                "numMirroringThreads must be positive".to_string(),
            ));
        }
        if self.max_num_files_per_mirror == 0 {
            return Err(MirrorError::InvalidConfig(
                "maxNumFilesPerMirror must be positive".to_string(),
            ));
        }
        if self.max_num_bytes_per_mirror == 0 {
            return Err(MirrorError::InvalidConfig(
                "maxNumBytesPerMirror must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for MirroringServicePluginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MirroringServicePluginConfig{{enabled={}, numMirroringThreads={}, maxNumFilesPerMirror={}, \
             maxNumBytesPerMirror={}, zonePinned={}, defaultMirrorAuthor=",
            self.enabled,
            self.num_mirroring_threads,
            self.max_num_files_per_mirror,
            self.max_num_bytes_per_mirror,
            self.zone_pinned,
        )?;
        match &self.default_mirror_author {
            Some(author) => write!(f, "{}}}", author),
            None => f.write_str("null}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom() -> MirroringServicePluginConfig {
        MirroringServicePluginConfig::new(
            true,
            32,
            16384,
            64 * 1048576,
            true,
            Some(Author::new("Test Mirror", "mirror@example.com")),
        )
    }

    #[test]
    fn test_serialize_and_deserialize() {
        let json = serde_json::to_string(&custom()).unwrap();
        assert!(json.contains("\"defaultMirrorAuthor\""));
        assert!(json.contains("\"name\":\"Test Mirror\""));
        assert!(json.contains("\"email\":\"mirror@example.com\""));

        let back: MirroringServicePluginConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, custom());
    }

    #[test]
    fn test_deserialize_without_default_author() {
        let json = r#"{"enabled":true,"numMirroringThreads":16,"maxNumFilesPerMirror":8192,
                       "maxNumBytesPerMirror":33554432,"zonePinned":false}"#;
        let config: MirroringServicePluginConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_num_bytes_per_mirror, 33554432);
        assert_eq!(config.default_mirror_author, None);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: MirroringServicePluginConfig = serde_json::from_str(r#"{"enabled":true}"#).unwrap();
        assert_eq!(config, MirroringServicePluginConfig::default());
        assert_eq!(config.num_mirroring_threads, DEFAULT_NUM_MIRRORING_THREADS);
        assert_eq!(config.max_num_files_per_mirror, DEFAULT_MAX_NUM_FILES_PER_MIRROR);
        assert_eq!(config.max_num_bytes_per_mirror, DEFAULT_MAX_NUM_BYTES_PER_MIRROR);
        assert!(!config.zone_pinned);
    }

    #[test]
    fn test_display() {
        let s = custom().to_string();
        assert!(s.contains("numMirroringThreads=32"));
        assert!(s.contains("maxNumFilesPerMirror=16384"));
        assert!(s.contains("maxNumBytesPerMirror=67108864"));
        assert!(s.contains("zonePinned=true"));
        assert!(s.contains("defaultMirrorAuthor=Author[\"Test Mirror\" <mirror@example.com>]"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = MirroringServicePluginConfig::default();
        assert!(config.validate().is_ok());
        config.num_mirroring_threads = 0;
        assert!(matches!(config.validate(), Err(MirrorError::InvalidConfig(_))));
    }
}
