//! Configuration for buse.

use std::path::{Path, PathBuf};

use nbd::{DeviceGeometry, NBD_MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::server::ServerConfig;

const MIN_BLOCK_SIZE: u64 = 512;
const MAX_BLOCK_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// NBD device special file.
    pub path: PathBuf,
    pub block_size: Option<u64>,
    pub size_bytes: Option<u64>,
    pub size_blocks: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: default_device_path(),
            block_size: None,
            size_bytes: None,
            size_blocks: None,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad_block_size = self.block_size.is_some_and(|block_size| {
            !block_size.is_power_of_two()
                || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        });
        if bad_block_size {
            return Err(ConfigError::InvalidValue {
                field: "device.block_size",
                reason: "must be a power of two between 512 and 65536",
            });
        }
        if self.size_bytes == Some(0) || self.size_blocks == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "device.size_bytes",
                reason: "must be > 0",
            });
        }
        if let (Some(block_size), Some(size_bytes), Some(size_blocks)) =
            (self.block_size, self.size_bytes, self.size_blocks)
        {
            if size_blocks.checked_mul(block_size) != Some(size_bytes) {
                return Err(ConfigError::InconsistentGeometry {
                    block_size,
                    size_bytes,
                    size_blocks,
                });
            }
        }
        Ok(())
    }

    /// Total size in bytes, if it can be derived from the configured fields.
    pub fn resolved_size_bytes(&self) -> Option<u64> {
        self.size_bytes.or_else(|| {
            let blocks = self.size_blocks?;
            blocks.checked_mul(self.effective_block_size()?)
        })
    }

    /// Block size sent to the kernel. A block count without a block size
    /// is counted in 512-byte blocks, so that size is sent explicitly rather
    /// than left to the driver's own default.
    fn effective_block_size(&self) -> Option<u64> {
        self.block_size.or_else(|| self.size_blocks.map(|_| MIN_BLOCK_SIZE))
    }

    /// Geometry for a device of `size_bytes`.
    ///
    /// The block count is derived when a block size is configured and the
    /// size is a whole number of blocks.
    pub fn geometry(&self, size_bytes: u64) -> DeviceGeometry {
        let block_size = self.effective_block_size();
        let size_blocks = self.size_blocks.or_else(|| {
            let block_size = block_size?;
            (size_bytes % block_size == 0).then_some(size_bytes / block_size)
        });
        DeviceGeometry {
            block_size,
            size_bytes: Some(size_bytes),
            size_blocks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Backing file, required for the file backend.
    pub path: Option<PathBuf>,
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind == BackendKind::File && self.path.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "backend.path",
                reason: "required for the file backend",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub max_payload_bytes: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            max_payload_bytes: NBD_MAX_PAYLOAD_SIZE,
        }
    }
}

impl ServerSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.max_payload_bytes",
                reason: "must be > 0",
            });
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_payload_bytes: self.max_payload_bytes,
        }
    }
}

fn default_device_path() -> PathBuf {
    PathBuf::from("/dev/nbd0")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()?;
        self.backend.validate()?;
        self.server.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.device.path, PathBuf::from("/dev/nbd0"));
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.server.max_payload_bytes, NBD_MAX_PAYLOAD_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_block_size() {
        for block_size in [0, 100, 256, 1000, 128 * 1024] {
            let config = DeviceConfig {
                block_size: Some(block_size),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{block_size}");
        }
    }

    #[test]
    fn rejects_inconsistent_geometry() {
        let config = DeviceConfig {
            block_size: Some(4096),
            size_bytes: Some(1 << 20),
            size_blocks: Some(100),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InconsistentGeometry { .. })
        ));
    }

    #[test]
    fn geometry_derives_blocks() {
        let config = DeviceConfig {
            block_size: Some(4096),
            ..Default::default()
        };
        let geometry = config.geometry(1 << 20);
        assert_eq!(geometry.size_blocks, Some(256));
        assert_eq!(geometry.size_bytes, Some(1 << 20));

        let geometry = config.geometry(5000);
        assert_eq!(geometry.size_blocks, None);
    }

    #[test]
    fn size_from_blocks() {
        let config = DeviceConfig {
            block_size: Some(1024),
            size_blocks: Some(8),
            ..Default::default()
        };
        assert_eq!(config.resolved_size_bytes(), Some(8192));
    }

    #[test]
    fn blocks_without_block_size_use_512() {
        let config = DeviceConfig {
            size_blocks: Some(8),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let size_bytes = config.resolved_size_bytes().unwrap();
        assert_eq!(size_bytes, 4096);
        let geometry = config.geometry(size_bytes);
        assert_eq!(geometry.block_size, Some(512));
        assert_eq!(geometry.size_blocks, Some(8));
        assert_eq!(geometry.size_bytes, Some(4096));
    }

    #[test]
    fn size_bytes_alone_leaves_block_size_to_kernel() {
        let config = DeviceConfig {
            size_bytes: Some(1 << 20),
            ..Default::default()
        };
        let geometry = config.geometry(1 << 20);
        assert_eq!(geometry.block_size, None);
        assert_eq!(geometry.size_blocks, None);
    }

    #[test]
    fn file_backend_requires_path() {
        let config = BackendConfig {
            kind: BackendKind::File,
            path: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [device]
            path = "/dev/nbd3"
            block_size = 4096
            size_bytes = 1048576

            [backend]
            kind = "file"
            path = "/var/lib/buse/disk.img"
            "#,
        )
        .unwrap();
        assert_eq!(config.device.path, PathBuf::from("/dev/nbd3"));
        assert_eq!(config.device.block_size, Some(4096));
        assert_eq!(config.backend.kind, BackendKind::File);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/buse.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }
}
