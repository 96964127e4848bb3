//! Host directory mounts into the guest.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One host-directory-to-guest mount from the task config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryMount {
    /// Host path to share. Required.
    pub path: String,
    /// Logical name the guest sees the share under.
    #[serde(default)]
    pub name: Option<String>,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Mount tag forwarded to the guest.
    #[serde(default)]
    pub tag: Option<String>,
}

/// Convert directory mounts into the virtualizer's `--dir` flags.
///
/// Each mount emits a single `--dir=[name:]path[:opt,opt...]` token, where
/// options are `ro` and `tag=<value>`. The options suffix is omitted
/// entirely when neither applies.
pub fn build_directory_args(dirs: &[DirectoryMount]) -> Result<Vec<String>> {
    let mut args = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let path = dir.path.trim();
        if path.is_empty() {
            return Err(Error::invalid_config(
                "directory.path is required for directory mounts",
            ));
        }

        let mut spec = String::new();
        if let Some(name) = dir.name.as_deref().map(str::trim) {
            if !name.is_empty() {
                spec.push_str(name);
                spec.push(':');
            }
        }
        spec.push_str(path);

        let mut opts = Vec::with_capacity(2);
        if dir.read_only {
            opts.push("ro".to_string());
        }
        if let Some(tag) = dir.tag.as_deref().map(str::trim) {
            if !tag.is_empty() {
                opts.push(format!("tag={}", tag));
            }
        }
        if !opts.is_empty() {
            spec.push(':');
            spec.push_str(&opts.join(","));
        }

        args.push(format!("--dir={}", spec));
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_mounts_no_args() {
        assert!(build_directory_args(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_simple_path() {
        let dirs = [DirectoryMount {
            path: "/host/data".into(),
            ..Default::default()
        }];
        assert_eq!(build_directory_args(&dirs).unwrap(), vec!["--dir=/host/data"]);
    }

    #[test]
    fn test_named_mount() {
        let dirs = [DirectoryMount {
            path: "/host/data".into(),
            name: Some("data".into()),
            ..Default::default()
        }];
        assert_eq!(
            build_directory_args(&dirs).unwrap(),
            vec!["--dir=data:/host/data"]
        );
    }

    #[test]
    fn test_read_only() {
        let dirs = [DirectoryMount {
            path: "/host/secrets".into(),
            read_only: true,
            ..Default::default()
        }];
        assert_eq!(
            build_directory_args(&dirs).unwrap(),
            vec!["--dir=/host/secrets:ro"]
        );
    }

    #[test]
    fn test_tag() {
        let dirs = [DirectoryMount {
            path: "/host/assets".into(),
            tag: Some("assets".into()),
            ..Default::default()
        }];
        assert_eq!(
            build_directory_args(&dirs).unwrap(),
            vec!["--dir=/host/assets:tag=assets"]
        );
    }

    #[test]
    fn test_read_only_and_tag_compose() {
        let dirs = [DirectoryMount {
            path: "/host/shared".into(),
            read_only: true,
            tag: Some("shared".into()),
            ..Default::default()
        }];
        assert_eq!(
            build_directory_args(&dirs).unwrap(),
            vec!["--dir=/host/shared:ro,tag=shared"]
        );
    }

    #[test]
    fn test_multiple_mounts_keep_order() {
        let dirs = [
            DirectoryMount {
                path: "/a".into(),
                ..Default::default()
            },
            DirectoryMount {
                path: "/b".into(),
                name: Some("b".into()),
                read_only: true,
                ..Default::default()
            },
        ];
        assert_eq!(
            build_directory_args(&dirs).unwrap(),
            vec!["--dir=/a", "--dir=b:/b:ro"]
        );
    }

    #[test]
    fn test_empty_path_rejected() {
        let dirs = [DirectoryMount::default()];
        assert!(build_directory_args(&dirs).is_err());

        let dirs = [DirectoryMount {
            path: "   ".into(),
            ..Default::default()
        }];
        assert!(build_directory_args(&dirs).is_err());
    }
}
