//! Machine-level save-state configuration.
//!
//! Loaded from TOML by front ends; every field has a default so an empty
//! document is a valid configuration.
//!
//! ```toml
//! game_id = "pacman"
//! strict = true
//! compress = false
//! byte_order = "native"   # "native" | "little" | "big"
//! rewind_capacity = 8
//! ```

use serde::{Deserialize, Serialize};

use crate::codec::Endian;

/// Errors from reading or writing a configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot encode config: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Byte order used when writing save bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Whatever the host uses.
    #[default]
    Native,
    Little,
    Big,
}

impl ByteOrder {
    pub fn endian(self) -> Endian {
        match self {
            ByteOrder::Native => Endian::NATIVE,
            ByteOrder::Little => Endian::Little,
            ByteOrder::Big => Endian::Big,
        }
    }
}

/// Save-state settings for one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Identifier stamped into save headers and required on load. Empty
    /// disables the game check on load.
    pub game_id: String,
    /// Fail illegal registrations immediately instead of counting them.
    pub strict: bool,
    /// zlib-compress save bodies.
    pub compress: bool,
    pub byte_order: ByteOrder,
    /// In-memory rewind snapshots kept by a machine.
    pub rewind_capacity: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            game_id: String::new(),
            strict: false,
            compress: false,
            byte_order: ByteOrder::Native,
            rewind_capacity: 8,
        }
    }
}

impl StateConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }
}
