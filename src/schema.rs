//! Config schemas the driver declares to the host.
//!
//! The host validates raw job configuration against these schemas before any
//! driver call is made. The values are built once at startup and passed into
//! plugin registration; no process-wide mutable schema state exists.

use serde_json::{json, Value};

/// The pair of schemas a driver declares: one for the plugin-wide config
/// block, one for the per-task driver block.
#[derive(Debug, Clone)]
pub struct DriverSchemas {
    /// Schema for the plugin-wide config block.
    pub plugin: Value,
    /// Schema for the per-task driver block.
    pub task: Value,
}

impl DriverSchemas {
    /// Build the schemas for this driver.
    pub fn new() -> Self {
        Self {
            plugin: plugin_schema(),
            task: task_schema(),
        }
    }
}

impl Default for DriverSchemas {
    fn default() -> Self {
        Self::new()
    }
}

fn attr(attr_type: &str, required: bool) -> Value {
    json!({"type": attr_type, "required": required})
}

fn attr_with_default(attr_type: &str, default: Value) -> Value {
    json!({"type": attr_type, "required": false, "default": default})
}

fn plugin_schema() -> Value {
    json!({
        "attributes": {
            "enabled": attr_with_default("bool", json!(true)),
        }
    })
}

fn task_schema() -> Value {
    json!({
        "attributes": {
            "image": attr("string", true),
            "ssh_user": attr_with_default("string", json!("admin")),
            "ssh_password": attr("string", false),
            "ssh_strict_host_key": attr_with_default("bool", json!(false)),
            "show_ui": attr_with_default("bool", json!(false)),
            "disk_size": attr_with_default("number", json!(0)),
            "guest_stats": attr_with_default("bool", json!(false)),
        },
        "blocks": {
            "auth": {
                "attributes": {
                    "username": attr("string", false),
                    "password": attr("string", false),
                }
            },
            "network": {
                "attributes": {
                    "mode": attr("string", false),
                    "bridged_interface": attr("string", false),
                    "softnet_allow": attr("list(string)", false),
                    "softnet_expose": attr("list(string)", false),
                }
            },
            "root_disk": {
                "attributes": {
                    "read_only": attr("bool", false),
                    "caching": attr("string", false),
                    "sync": attr("string", false),
                }
            },
            "directories": {
                "list": true,
                "attributes": {
                    "path": attr("string", true),
                    "name": attr("string", false),
                    "read_only": attr("bool", false),
                    "tag": attr("string", false),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_schema_marks_image_required() {
        let schemas = DriverSchemas::new();
        assert_eq!(
            schemas.task["attributes"]["image"]["required"],
            Value::Bool(true)
        );
    }

    #[test]
    fn test_plugin_schema_defaults_enabled() {
        let schemas = DriverSchemas::new();
        assert_eq!(
            schemas.plugin["attributes"]["enabled"]["default"],
            Value::Bool(true)
        );
    }

    #[test]
    fn test_schema_blocks_cover_config_surface() {
        let schemas = DriverSchemas::new();
        for block in ["auth", "network", "root_disk", "directories"] {
            assert!(
                schemas.task["blocks"].get(block).is_some(),
                "missing block: {}",
                block
            );
        }
    }
}
