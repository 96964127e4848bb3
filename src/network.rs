//! Guest networking configuration and argument construction.
//!
//! Exactly one network mode is active per VM: default NAT, host, bridged, or
//! softnet (an isolated path with explicit allow/expose lists). Softnet is
//! implied when allow or expose lists are present without an explicit mode.

use serde::{Deserialize, Serialize};

use crate::config::clean_value;
use crate::error::{Error, Result};

/// Declarative network block of a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Requested mode: `host`, `bridged`, `softnet`, or an alias for the
    /// default NAT mode (empty, `default`, `shared`, `nat`).
    #[serde(default)]
    pub mode: String,
    /// Interface to bridge onto. Required for bridged mode, rejected elsewhere.
    #[serde(default)]
    pub bridged_interface: String,
    /// CIDR list the softnet path may reach.
    #[serde(default)]
    pub softnet_allow: Vec<String>,
    /// `host:guest` port list the softnet path exposes.
    #[serde(default)]
    pub softnet_expose: Vec<String>,
}

/// Compute the virtualizer's networking flags for a task's network block.
///
/// Enforces mutual exclusivity among host, bridged, and softnet modes and
/// rejects unknown mode strings. `None` (and the plain default mode) emit no
/// flags at all.
pub fn build_network_args(cfg: Option<&NetworkConfig>) -> Result<Vec<String>> {
    let cfg = match cfg {
        Some(cfg) => cfg,
        None => return Ok(Vec::new()),
    };

    let mode = clean_value(&cfg.mode);
    let bridged_if = cfg.bridged_interface.trim();

    let is_default = matches!(mode.as_str(), "" | "default" | "shared" | "nat");
    let is_host = mode == "host";
    let is_bridged = mode == "bridged";
    let is_softnet = mode == "softnet";

    let has_softnet_lists = !cfg.softnet_allow.is_empty() || !cfg.softnet_expose.is_empty();
    // No explicit mode but allow/expose lists present implies softnet.
    let implied_softnet = is_default && has_softnet_lists;

    if is_host {
        if !bridged_if.is_empty() || has_softnet_lists {
            return Err(Error::invalid_config(
                "networking options conflict: host mode cannot be combined with \
                 bridged_interface or softnet options",
            ));
        }
        return Ok(vec!["--net-host".to_string()]);
    }

    if is_bridged {
        if bridged_if.is_empty() {
            return Err(Error::invalid_config(
                "bridged mode requires 'bridged_interface'",
            ));
        }
        if has_softnet_lists {
            return Err(Error::invalid_config(
                "networking options conflict: bridged mode cannot be combined with \
                 softnet options",
            ));
        }
        return Ok(vec!["--net-bridged".to_string(), bridged_if.to_string()]);
    }

    if is_softnet || implied_softnet {
        if !bridged_if.is_empty() {
            return Err(Error::invalid_config(
                "networking options conflict: softnet mode cannot be combined with \
                 bridged_interface",
            ));
        }
        let mut args = vec!["--net-softnet".to_string()];
        if !cfg.softnet_allow.is_empty() {
            args.push("--net-softnet-allow".to_string());
            args.push(cfg.softnet_allow.join(","));
        }
        if !cfg.softnet_expose.is_empty() {
            args.push("--net-softnet-expose".to_string());
            args.push(cfg.softnet_expose.join(","));
        }
        return Ok(args);
    }

    if !is_default {
        return Err(Error::invalid_config(format!(
            "unknown networking mode: {}",
            mode
        )));
    }

    // Default shared (NAT) networking needs no flags.
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_no_args() {
        assert!(build_network_args(None).unwrap().is_empty());
        let cfg = NetworkConfig::default();
        assert!(build_network_args(Some(&cfg)).unwrap().is_empty());
    }

    #[test]
    fn test_default_aliases() {
        for mode in ["default", "shared", "nat", "NAT", "  Default "] {
            let cfg = NetworkConfig {
                mode: mode.to_string(),
                ..Default::default()
            };
            assert!(
                build_network_args(Some(&cfg)).unwrap().is_empty(),
                "mode: {}",
                mode
            );
        }
    }

    #[test]
    fn test_host_mode() {
        let cfg = NetworkConfig {
            mode: "host".into(),
            ..Default::default()
        };
        assert_eq!(build_network_args(Some(&cfg)).unwrap(), vec!["--net-host"]);
    }

    #[test]
    fn test_bridged_mode() {
        let cfg = NetworkConfig {
            mode: "bridged".into(),
            bridged_interface: "en0".into(),
            ..Default::default()
        };
        assert_eq!(
            build_network_args(Some(&cfg)).unwrap(),
            vec!["--net-bridged", "en0"]
        );
    }

    #[test]
    fn test_softnet_mode() {
        let cfg = NetworkConfig {
            mode: "softnet".into(),
            ..Default::default()
        };
        assert_eq!(
            build_network_args(Some(&cfg)).unwrap(),
            vec!["--net-softnet"]
        );
    }

    #[test]
    fn test_softnet_allow_implies_softnet() {
        let cfg = NetworkConfig {
            softnet_allow: vec!["192.168.0.0/24".into(), "10.0.0.0/16".into()],
            ..Default::default()
        };
        assert_eq!(
            build_network_args(Some(&cfg)).unwrap(),
            vec![
                "--net-softnet",
                "--net-softnet-allow",
                "192.168.0.0/24,10.0.0.0/16"
            ]
        );
    }

    #[test]
    fn test_softnet_expose_implies_softnet() {
        let cfg = NetworkConfig {
            softnet_expose: vec!["2222:22".into(), "8080:80".into()],
            ..Default::default()
        };
        assert_eq!(
            build_network_args(Some(&cfg)).unwrap(),
            vec!["--net-softnet", "--net-softnet-expose", "2222:22,8080:80"]
        );
    }

    #[test]
    fn test_softnet_allow_and_expose() {
        let cfg = NetworkConfig {
            softnet_allow: vec!["0.0.0.0/0".into()],
            softnet_expose: vec!["2222:22".into()],
            ..Default::default()
        };
        assert_eq!(
            build_network_args(Some(&cfg)).unwrap(),
            vec![
                "--net-softnet",
                "--net-softnet-allow",
                "0.0.0.0/0",
                "--net-softnet-expose",
                "2222:22"
            ]
        );
    }

    #[test]
    fn test_conflicting_and_invalid_combinations() {
        let cases = [
            // host combined with bridged interface
            NetworkConfig {
                mode: "host".into(),
                bridged_interface: "en0".into(),
                ..Default::default()
            },
            // host combined with softnet options
            NetworkConfig {
                mode: "host".into(),
                softnet_allow: vec!["192.168.0.0/24".into()],
                ..Default::default()
            },
            // bridged without an interface
            NetworkConfig {
                mode: "bridged".into(),
                ..Default::default()
            },
            // bridged combined with softnet options
            NetworkConfig {
                mode: "bridged".into(),
                bridged_interface: "en0".into(),
                softnet_expose: vec!["2222:22".into()],
                ..Default::default()
            },
            // softnet combined with bridged interface
            NetworkConfig {
                mode: "softnet".into(),
                bridged_interface: "en0".into(),
                ..Default::default()
            },
            // unknown mode string
            NetworkConfig {
                mode: "weird".into(),
                ..Default::default()
            },
        ];

        for (i, cfg) in cases.iter().enumerate() {
            assert!(
                build_network_args(Some(cfg)).is_err(),
                "case {} should be rejected",
                i
            );
        }
    }
}
