// Build-time version from Cargo.toml

use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Debug, Clone, Copy, Serialize)]
pub struct VersionInfo {
    pub name: &'static str,
    pub version: &'static str,
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        name: NAME,
        version: VERSION,
    }
}
