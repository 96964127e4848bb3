//! Error types for the tart task driver.
//!
//! Error messages follow a consistent format:
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`
//! - **Case**: all lowercase
//! - **Context**: include relevant identifiers (task id, VM name, command) when available
//!
//! Callers that need to distinguish "already gone" from "real failure" can
//! match on [`Error::TaskNotFound`] / [`Error::VmNotFound`] or use
//! [`Error::is_not_found`]. Capability gaps surface as the permanent,
//! non-retryable [`Error::NotSupported`].

use thiserror::Error;

/// Result type alias using the driver's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in driver operations.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Task Lifecycle Errors
    // ========================================================================
    /// Operation referenced a task id the driver does not know about.
    #[error("task not found: {id}")]
    TaskNotFound {
        /// Identifier of the task that was not found.
        id: String,
    },

    /// StartTask was called for a task id that is already registered.
    #[error("task already started: {id}")]
    TaskAlreadyStarted {
        /// Identifier of the duplicate task.
        id: String,
    },

    /// DestroyTask was called without force while the task is still running.
    #[error("cannot destroy running task: {id}")]
    TaskStillRunning {
        /// Identifier of the running task.
        id: String,
    },

    /// A persisted task handle could not be decoded or has the wrong version.
    #[error("invalid task handle: {reason}")]
    InvalidHandle {
        /// Explanation of why the handle is unusable.
        reason: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid or conflicting declarative task configuration.
    ///
    /// Detected synchronously, before any subprocess runs. Never retried.
    #[error("invalid task config: {reason}")]
    InvalidTaskConfig {
        /// Explanation of the configuration problem.
        reason: String,
    },

    // ========================================================================
    // Virtualizer Errors
    // ========================================================================
    /// The virtualization tool exited non-zero or produced unusable output.
    #[error("command '{command}' failed: {reason}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Exit status and captured stderr.
        reason: String,
    },

    /// No VM with the given name is known to the virtualization tool.
    #[error("vm not found: {name}")]
    VmNotFound {
        /// Name of the VM that was not found.
        name: String,
    },

    /// The VM's guest address could not be resolved.
    ///
    /// Not retried at the client layer; the guest channel supervisor owns
    /// the retry policy for this variant.
    #[error("vm address unavailable: {name}: {reason}")]
    VmAddressUnavailable {
        /// Name of the VM whose address could not be resolved.
        name: String,
        /// Explanation of the resolution failure.
        reason: String,
    },

    // ========================================================================
    // Capability Errors
    // ========================================================================
    /// The driver variant does not support the requested operation.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    // ========================================================================
    // IO Errors
    // ========================================================================
    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a task not found error.
    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::TaskNotFound { id: id.into() }
    }

    /// Create a task already started error.
    pub fn task_already_started(id: impl Into<String>) -> Self {
        Self::TaskAlreadyStarted { id: id.into() }
    }

    /// Create an invalid handle error.
    pub fn invalid_handle(reason: impl Into<String>) -> Self {
        Self::InvalidHandle {
            reason: reason.into(),
        }
    }

    /// Create an invalid task config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidTaskConfig {
            reason: reason.into(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a VM not found error.
    pub fn vm_not_found(name: impl Into<String>) -> Self {
        Self::VmNotFound { name: name.into() }
    }

    /// Create a VM address unavailable error.
    pub fn address_unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VmAddressUnavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a not supported error.
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
        }
    }

    /// Whether this error means "the referenced entity is already gone".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound { .. } | Self::VmNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_not_found_includes_id() {
        let err = Error::task_not_found("task-123");
        let msg = err.to_string();
        assert!(msg.contains("task-123"));
        assert!(msg.contains("not found"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_vm_not_found_includes_name() {
        let err = Error::vm_not_found("alloc-abc");
        assert!(err.to_string().contains("alloc-abc"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_command_failed_includes_command_and_reason() {
        let err = Error::command_failed("tart clone", "exit status 1: image not found");
        let msg = err.to_string();
        assert!(msg.contains("tart clone"));
        assert!(msg.contains("image not found"));
        assert!(msg.contains("failed"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_supported_is_not_a_not_found() {
        let err = Error::not_supported("signals");
        assert!(err.to_string().contains("signals"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_all_errors_are_lowercase() {
        let errors: Vec<Error> = vec![
            Error::task_not_found("t"),
            Error::task_already_started("t"),
            Error::invalid_handle("bad version"),
            Error::invalid_config("reason"),
            Error::command_failed("cmd", "reason"),
            Error::vm_not_found("vm"),
            Error::address_unavailable("vm", "reason"),
            Error::not_supported("exec"),
        ];

        for err in errors {
            let msg = err.to_string();
            let first_char = msg.chars().next().unwrap();
            assert!(
                first_char.is_lowercase(),
                "error message should start lowercase: {}",
                msg
            );
        }
    }
}
