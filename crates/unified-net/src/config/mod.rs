//! Fabric config loader (strict parsing).

pub mod schema;

use std::fs;

use unified_core::error::{FabricError, Result};

pub use schema::{BackendKind, FabricConfig};

pub fn load_from_file(path: &str) -> Result<FabricConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| FabricError::Config(format!("read config failed ({path}): {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<FabricConfig> {
    let cfg: FabricConfig = serde_yaml::from_str(s)
        .map_err(|e| FabricError::Config(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
