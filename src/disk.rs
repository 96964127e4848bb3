//! Root disk options and argument construction.

use serde::{Deserialize, Serialize};

use crate::config::clean_value;
use crate::error::{Error, Result};

/// Root disk caching behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachingMode {
    /// Let the virtualizer decide.
    Automatic,
    /// Bypass the host page cache.
    Uncached,
    /// Use the host page cache.
    Cached,
}

impl CachingMode {
    fn parse(raw: &str) -> Result<Self> {
        match clean_value(raw).as_str() {
            "automatic" => Ok(Self::Automatic),
            "uncached" => Ok(Self::Uncached),
            "cached" => Ok(Self::Cached),
            other => Err(Error::invalid_config(format!(
                "unknown root disk caching mode: {}",
                other
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Uncached => "uncached",
            Self::Cached => "cached",
        }
    }
}

/// Root disk sync behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// fsync on flush.
    Fsync,
    /// Full barrier semantics.
    Full,
    /// No sync guarantees.
    None,
}

impl SyncMode {
    fn parse(raw: &str) -> Result<Self> {
        match clean_value(raw).as_str() {
            "fsync" => Ok(Self::Fsync),
            "full" => Ok(Self::Full),
            "none" => Ok(Self::None),
            other => Err(Error::invalid_config(format!(
                "unknown root disk sync mode: {}",
                other
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Fsync => "fsync",
            Self::Full => "full",
            Self::None => "none",
        }
    }
}

/// Declarative root disk block of a task.
///
/// Mode strings are free-form in the config and normalized (lowercase,
/// trimmed) before validation against the mode enums.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootDiskOptions {
    /// Attach the root disk read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Caching mode string, validated against [`CachingMode`].
    #[serde(default)]
    pub caching: Option<String>,
    /// Sync mode string, validated against [`SyncMode`].
    #[serde(default)]
    pub sync: Option<String>,
}

/// Compute the virtualizer's root disk flag for a task's root disk block.
///
/// A missing block emits no argument. A present block always emits exactly
/// one `--root-disk-opts=<ro?,caching=...?,sync=...?>` token, with an empty
/// tail when no option applies.
pub fn build_root_disk_args(cfg: Option<&RootDiskOptions>) -> Result<Vec<String>> {
    let cfg = match cfg {
        Some(cfg) => cfg,
        None => return Ok(Vec::new()),
    };

    let mut opts = Vec::new();
    if cfg.read_only {
        opts.push("ro".to_string());
    }
    if let Some(raw) = &cfg.caching {
        let mode = CachingMode::parse(raw)?;
        opts.push(format!("caching={}", mode.as_str()));
    }
    if let Some(raw) = &cfg.sync {
        let mode = SyncMode::parse(raw)?;
        opts.push(format!("sync={}", mode.as_str()));
    }

    Ok(vec![format!("--root-disk-opts={}", opts.join(","))])
}
