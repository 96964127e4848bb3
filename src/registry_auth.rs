//! Registry credentials for image pulls.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Credentials for the image registry.
///
/// Only considered usable when both fields are non-empty; otherwise the
/// setup path skips the login step and relies on ambient credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryAuth {
    /// Registry username.
    #[serde(default)]
    pub username: String,
    /// Registry password or token.
    #[serde(default)]
    pub password: String,
}

impl RegistryAuth {
    /// Whether these credentials are complete enough to attempt a login.
    pub fn valid(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Extract the registry host from an image reference.
///
/// The host is the URL authority when the reference carries a scheme, or the
/// substring before the first `/` otherwise.
pub fn registry_host(image: &str) -> Result<String> {
    let rest = match image.split_once("://") {
        Some((_, rest)) => rest,
        None => image,
    };

    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(Error::invalid_config(format!(
            "cannot determine registry host from image reference '{}'",
            image
        )));
    }
    Ok(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_host() {
        let cases = [
            (
                "123474567.dkr.ecr.us-east-2.amazonaws.com/testing-container:latest",
                "123474567.dkr.ecr.us-east-2.amazonaws.com",
            ),
            ("ghcr.io/owner/repo:tag", "ghcr.io"),
            ("https://gcr.io/owner/repo:tag", "gcr.io"),
            ("docker.io/library/ubuntu:latest", "docker.io"),
        ];

        for (input, expected) in cases {
            assert_eq!(registry_host(input).unwrap(), expected, "input: {}", input);
        }
    }

    #[test]
    fn test_registry_host_empty_reference() {
        assert!(registry_host("").is_err());
        assert!(registry_host("https:///repo").is_err());
    }

    #[test]
    fn test_auth_validity() {
        assert!(!RegistryAuth::default().valid());
        assert!(!RegistryAuth {
            username: "user".into(),
            password: String::new(),
        }
        .valid());
        assert!(!RegistryAuth {
            username: String::new(),
            password: "pass".into(),
        }
        .valid());
        assert!(RegistryAuth {
            username: "user".into(),
            password: "pass".into(),
        }
        .valid());
    }
}
