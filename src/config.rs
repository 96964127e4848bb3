//! Plugin-wide and per-task configuration.
//!
//! The host validates raw HCL/JSON against the schemas in [`crate::schema`]
//! before it ever reaches the driver, then hands the decoded blocks over as
//! JSON values. Decoding here is the driver's last line of defense; conflict
//! rules that span fields (network mode exclusivity, disk mode enums, mount
//! paths) are enforced by the argument builders, which [`TaskConfig::validate`]
//! runs eagerly so misconfiguration fails before any subprocess is spawned.

use serde::{Deserialize, Serialize};

use crate::disk::{build_root_disk_args, RootDiskOptions};
use crate::error::{Error, Result};
use crate::mount::{build_directory_args, DirectoryMount};
use crate::network::{build_network_args, NetworkConfig};
use crate::registry_auth::RegistryAuth;

/// Default guest shell user.
pub const DEFAULT_SSH_USER: &str = "admin";

/// Lowercase and trim a free-form config value before validation.
pub(crate) fn clean_value(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Plugin-wide configuration set by the host's SetConfig call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Whether the driver accepts work on this node.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl DriverConfig {
    /// Decode the plugin config block.
    pub fn decode(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::invalid_config(format!("plugin config decode failed: {}", e)))
    }
}

/// The per-task driver config block, immutable once decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Image reference to clone the VM from. Required.
    pub image: String,
    /// Guest shell username.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Guest shell password.
    #[serde(default)]
    pub ssh_password: String,
    /// Verify the guest's host key instead of accepting any.
    #[serde(default)]
    pub ssh_strict_host_key: bool,
    /// Run the VM with its UI visible instead of headless.
    #[serde(default)]
    pub show_ui: bool,
    /// Root disk size in GB. Zero leaves the image's size unchanged.
    #[serde(default)]
    pub disk_size: u32,
    /// Sample resource usage from inside the guest instead of scanning
    /// host processes.
    #[serde(default)]
    pub guest_stats: bool,
    /// Registry credentials for pulling the image.
    #[serde(default)]
    pub auth: Option<RegistryAuth>,
    /// Guest networking block.
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    /// Root disk behavior block.
    #[serde(default)]
    pub root_disk: Option<RootDiskOptions>,
    /// Host directories shared into the guest.
    #[serde(default)]
    pub directories: Vec<DirectoryMount>,
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

impl TaskConfig {
    /// Decode and validate a per-task driver config block.
    pub fn decode(value: &serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| Error::invalid_config(format!("task config decode failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid or conflicting configuration before any subprocess runs.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::invalid_config("image is required"));
        }
        // The builders own the per-block rules; run them now so conflicts
        // surface at decode time rather than at launch.
        build_network_args(self.network.as_ref())?;
        build_root_disk_args(self.root_disk.as_ref())?;
        build_directory_args(&self.directories)?;
        Ok(())
    }
}
