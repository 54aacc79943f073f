//! Typed configuration, loaded eagerly at startup from the block-structured
//! file described in [`parser`]. Any malformed config (unknown database,
//! changer, or drive type) fails startup rather than surfacing once the
//! server is already serving traffic. A drive's `group` is just a label --
//! group membership is assembled from whichever drives share one, with no
//! separate declaration to validate against.

mod parser;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

pub use parser::{Item, Value};

#[derive(Debug, Clone)]
pub struct ChunkstoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct InventoryConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LtfsConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MockTimings {
    pub unmount: Duration,
    pub unload: Duration,
    pub load: Duration,
    pub mount: Duration,
    pub format: Duration,
}

impl Default for MockTimings {
    fn default() -> Self {
        MockTimings {
            unmount: Duration::ZERO,
            unload: Duration::ZERO,
            load: Duration::ZERO,
            mount: Duration::ZERO,
            format: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockingConfig {
    pub chunksize: Option<usize>,
    pub timings: MockTimings,
}

#[derive(Debug, Clone, Default)]
pub struct DebugConfig {
    pub mocking: Option<MockingConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangerKind {
    Mtx,
    Mock,
}

#[derive(Debug, Clone)]
pub struct ChangerConfig {
    pub device: String,
    pub kind: ChangerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveKind {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub device: String,
    pub kind: DriveKind,
    pub slot: u32,
    pub group: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LibraryConfig {
    pub name: String,
    pub changer: ChangerConfig,
    pub drives: Vec<DriveConfig>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub chunkstore: ChunkstoreConfig,
    pub inventory: InventoryConfig,
    pub ltfs: LtfsConfig,
    pub debug: DebugConfig,
    pub libraries: Vec<LibraryConfig>,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let items = parser::parse_document(text).map_err(|err| ConfigError::Parse {
            offset: 0,
            message: err.to_string(),
        })?;

        let mut chunkstore = None;
        let mut inventory = None;
        let mut ltfs = None;
        let mut debug = DebugConfig::default();
        let mut libraries = Vec::new();

        for item in items {
            let Item::Block { name, label, body } = item else {
                continue;
            };

            match name.as_str() {
                "chunkstore" => chunkstore = Some(build_chunkstore(&body)?),
                "inventory" => inventory = Some(build_inventory(&body)?),
                "ltfs" => ltfs = Some(build_ltfs(&body)?),
                "debug" => debug = build_debug(&body)?,
                "library" => {
                    let name = label.unwrap_or_default();
                    libraries.push(build_library(name, &body)?);
                }
                _ => {}
            }
        }

        let config = Config {
            chunkstore: chunkstore.ok_or_else(|| ConfigError::Parse {
                offset: 0,
                message: "missing chunkstore block".into(),
            })?,
            inventory: inventory.ok_or_else(|| ConfigError::Parse {
                offset: 0,
                message: "missing inventory block".into(),
            })?,
            ltfs: ltfs.ok_or_else(|| ConfigError::Parse {
                offset: 0,
                message: "missing ltfs block".into(),
            })?,
            debug,
            libraries,
        };

        Ok(config)
    }
}

fn attrs(body: &[Item]) -> HashMap<&str, &Value> {
    body.iter()
        .filter_map(|item| match item {
            Item::Attr { key, value } => Some((key.as_str(), value)),
            Item::Block { .. } => None,
        })
        .collect()
}

fn blocks<'a>(body: &'a [Item], name: &str) -> Vec<(&'a Option<String>, &'a Vec<Item>)> {
    body.iter()
        .filter_map(|item| match item {
            Item::Block { name: n, label, body } if n == name => Some((label, body)),
            _ => None,
        })
        .collect()
}

fn require_str(attrs: &HashMap<&str, &Value>, key: &str) -> Result<String, ConfigError> {
    attrs
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::Parse {
            offset: 0,
            message: format!("missing required attribute '{key}'"),
        })
}

fn build_chunkstore(body: &[Item]) -> Result<ChunkstoreConfig, ConfigError> {
    let attrs = attrs(body);
    let kind = require_str(&attrs, "type")?;
    if kind != "kv" {
        return Err(ConfigError::UnknownChunkstoreType(kind));
    }
    Ok(ChunkstoreConfig {
        path: require_str(&attrs, "path")?.into(),
    })
}

fn build_inventory(body: &[Item]) -> Result<InventoryConfig, ConfigError> {
    let attrs = attrs(body);
    let kind = require_str(&attrs, "type")?;
    if kind != "sqlite3" {
        return Err(ConfigError::UnknownInventoryType(kind));
    }
    Ok(InventoryConfig {
        path: require_str(&attrs, "path")?.into(),
    })
}

fn build_ltfs(body: &[Item]) -> Result<LtfsConfig, ConfigError> {
    let attrs = attrs(body);
    Ok(LtfsConfig {
        root: require_str(&attrs, "root")?.into(),
    })
}

fn build_debug(body: &[Item]) -> Result<DebugConfig, ConfigError> {
    let mocking_blocks = blocks(body, "mocking");
    let mocking = match mocking_blocks.first() {
        None => None,
        Some((_, body)) => Some(build_mocking(body)?),
    };
    Ok(DebugConfig { mocking })
}

fn build_mocking(body: &[Item]) -> Result<MockingConfig, ConfigError> {
    let attrs = attrs(body);
    let chunksize = attrs.get("chunksize").and_then(|v| v.as_int()).map(|n| n as usize);

    let timings_blocks = blocks(body, "timings");
    let timings = match timings_blocks.first() {
        None => MockTimings::default(),
        Some((_, body)) => build_timings(body)?,
    };

    Ok(MockingConfig { chunksize, timings })
}

fn build_timings(body: &[Item]) -> Result<MockTimings, ConfigError> {
    let attrs = attrs(body);
    let dur = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
        match attrs.get(key).and_then(|v| v.as_str()) {
            None => Ok(default),
            Some(s) => crate::duration::parse_duration(s)
                .map_err(|_| ConfigError::InvalidDuration(s.to_string())),
        }
    };

    Ok(MockTimings {
        unmount: dur("unmount", Duration::ZERO)?,
        unload: dur("unload", Duration::ZERO)?,
        load: dur("load", Duration::ZERO)?,
        mount: dur("mount", Duration::ZERO)?,
        format: dur("format", Duration::ZERO)?,
    })
}

fn build_library(name: String, body: &[Item]) -> Result<LibraryConfig, ConfigError> {
    let changer_blocks = blocks(body, "changer");
    let (label, changer_body) = changer_blocks.first().ok_or_else(|| ConfigError::Parse {
        offset: 0,
        message: format!("library '{name}' is missing a changer block"),
    })?;
    let changer = build_changer(label.clone().unwrap_or_default(), changer_body)?;

    let mut drives = Vec::new();
    for (label, drive_body) in blocks(body, "drive") {
        drives.push(build_drive(label.clone().unwrap_or_default(), drive_body)?);
    }

    Ok(LibraryConfig {
        name,
        changer,
        drives,
    })
}

fn build_changer(device: String, body: &[Item]) -> Result<ChangerConfig, ConfigError> {
    let attrs = attrs(body);
    let kind = require_str(&attrs, "type")?;
    let kind = match kind.as_str() {
        "mtx" => ChangerKind::Mtx,
        "mock" => ChangerKind::Mock,
        other => return Err(ConfigError::UnknownChangerType(other.to_string())),
    };
    Ok(ChangerConfig { device, kind })
}

fn build_drive(device: String, body: &[Item]) -> Result<DriveConfig, ConfigError> {
    let attrs = attrs(body);
    let kind = require_str(&attrs, "type")?;
    let kind = match kind.as_str() {
        "write" => DriveKind::Write,
        "read" => DriveKind::Read,
        other => return Err(ConfigError::UnknownDriveType(other.to_string())),
    };
    let slot = attrs
        .get("slot")
        .and_then(|v| v.as_int())
        .ok_or_else(|| ConfigError::Parse {
            offset: 0,
            message: format!("drive '{device}' is missing a 'slot' attribute"),
        })? as u32;
    let group = attrs.get("group").and_then(|v| v.as_str()).map(str::to_string);

    Ok(DriveConfig {
        device,
        kind,
        slot,
        group,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        chunkstore { type = "kv" path = "/data/chunks" }
        inventory  { type = "sqlite3" path = "/data/inventory.db" }
        ltfs       { root = "/ltfs" }
        debug {
          mocking {
            chunksize = 4096
            timings { unmount = "1s" unload = "2s" load = "2s" mount = "3s" format = "10s" }
          }
        }
        library "lib0" {
          changer "/dev/sg0" { type = "mtx" }
          drive "/dev/nst0" { type = "write" slot = 1 group = "g0" }
          drive "/dev/nst1" { type = "write" slot = 2 group = "g0" }
        }
    "#;

    #[test]
    fn parses_full_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.chunkstore.path, PathBuf::from("/data/chunks"));
        assert_eq!(config.libraries.len(), 1);
        assert_eq!(config.libraries[0].drives.len(), 2);
        assert_eq!(config.libraries[0].changer.kind, ChangerKind::Mtx);
        let mocking = config.debug.mocking.unwrap();
        assert_eq!(mocking.chunksize, Some(4096));
        assert_eq!(mocking.timings.format, Duration::from_secs(10));
    }

    #[test]
    fn rejects_unknown_chunkstore_type() {
        let text = r#"
            chunkstore { type = "weird" path = "/x" }
            inventory { type = "sqlite3" path = "/x" }
            ltfs { root = "/x" }
        "#;
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownChunkstoreType(_)));
    }

    #[test]
    fn drive_group_is_optional() {
        let text = r#"
            chunkstore { type = "kv" path = "/x" }
            inventory { type = "sqlite3" path = "/x" }
            ltfs { root = "/x" }
            library "lib0" {
              changer "/dev/sg0" { type = "mtx" }
              drive "/dev/nst0" { type = "write" slot = 1 }
            }
        "#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.libraries[0].drives[0].group, None);
    }
}
