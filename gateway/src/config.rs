//! Gateway configuration.
//!
//! Loaded from a TOML file. Byte budgets accept plain integers or
//! size strings (`"512K"`, `"16M"`, `"2G"`).

use anyhow::Context;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_BACKEND_THREADS: usize = 20;
pub const DEFAULT_MAX_BUFFER_BYTES: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_CACHED_BUFFER_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Reported in `X-Frontend-Server`; defaults to $HOSTNAME.
    pub server_name: Option<String>,
    pub compressed_cache: CacheSection,
    pub uncompressed_cache: CacheSection,
    pub backend: BackendSection,
    pub admin: AdminSection,
    /// Flat spellings accepted alongside the `[admin]` table.
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CacheSection {
    pub memory_bytes: ByteSize,
    pub filesystem_bytes: ByteSize,
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    /// Idle timeout of a backend conversation, in seconds.
    pub timeout: u64,
    /// Worker threads of the backend I/O runtime.
    pub threads: usize,
    pub max_buffer_bytes: ByteSize,
    pub max_cached_buffer_bytes: ByteSize,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_BACKEND_TIMEOUT_SECS,
            threads: DEFAULT_BACKEND_THREADS,
            max_buffer_bytes: ByteSize(DEFAULT_MAX_BUFFER_BYTES),
            max_cached_buffer_bytes: ByteSize(DEFAULT_MAX_CACHED_BUFFER_BYTES),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AdminSection {
    pub user: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Admin credentials, from `[admin]` or the flat keys.
    pub fn admin_credentials(&self) -> Option<(String, String)> {
        let user = self.admin.user.clone().or_else(|| self.user.clone())?;
        let password = self
            .admin
            .password
            .clone()
            .or_else(|| self.password.clone())?;
        Some((user, password))
    }

    pub fn server_name(&self) -> String {
        self.server_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// A byte count deserializable from an integer or a size string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

pub fn parse_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty size string".to_string());
    }
    let (digits, suffix) = match trimmed.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{trimmed}'"))?;
    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size suffix '{other}'")),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{trimmed}' overflows"))
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte count or a size string like \"16M\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<ByteSize, E> {
                if value < 0 {
                    return Err(E::custom("size must not be negative"));
                }
                Ok(ByteSize(value as u64))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<ByteSize, E> {
                parse_size(value).map(ByteSize).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}
