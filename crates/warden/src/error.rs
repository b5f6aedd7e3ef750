//! Error types used by the orchestrator and its collaborators.
//! This also handles converting to the numeric codes reported to clients.

use anyhow::Error as AnyError;
use oci_spec::OciSpecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An error occurred while parsing or building the OCI config
    #[error("{0}")]
    Oci(#[from] OciSpecError),
    /// An error that can occur while touching the bundle or spawning processes
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Others(String),
    /// Requested item is not found
    #[error("not found: {0}")]
    NotFound(String),
    /// Requested item already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Supplied arguments/options/config is invalid
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation was rejected because the container is not in a state required for the operation
    #[error("{0}")]
    FailedPrecondition(String),
    /// The external container runtime reported a failure
    #[error("runtime: {0}")]
    Runtime(String),
    /// A plugin hook failed
    #[error("plugin {name}: {reason}")]
    Plugin { name: String, reason: String },
    /// Any other error
    #[error("{0}")]
    Any(#[from] AnyError),
    /// Error while parsing JSON
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Error from the system
    #[error("{0}")]
    Errno(#[from] nix::errno::Errno),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

impl Error {
    /// Numeric code for the error, in the errno style clients of the daemon expect.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::InvalidArgument(_) | Error::Oci(_) | Error::Json(_) => libc::EINVAL,
            Error::FailedPrecondition(_) => libc::EBUSY,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Errno(e) => *e as i32,
            Error::Runtime(_) | Error::Plugin { .. } | Error::Any(_) | Error::Others(_) => {
                libc::EIO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use thiserror::Error;

    use super::*;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("{0}")]
        AnError(String),
    }

    #[test]
    fn test_error_to_code() {
        let e = Error::InvalidArgument("invalid argument".to_string());
        assert_eq!(e.code(), libc::EINVAL);
        assert_eq!(e.to_string(), "invalid argument: invalid argument");

        let e = Error::NotFound("not found".to_string());
        assert_eq!(e.code(), libc::ENOENT);
        assert_eq!(e.to_string(), "not found: not found");

        let e = Error::AlreadyExists("already exists".to_string());
        assert_eq!(e.code(), libc::EEXIST);

        let e = Error::FailedPrecondition("failed precondition".to_string());
        assert_eq!(e.code(), libc::EBUSY);
        assert_eq!(e.to_string(), "failed precondition");

        let e = Error::Errno(nix::errno::Errno::ESRCH);
        assert_eq!(e.code(), libc::ESRCH);

        let e = Error::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(e.code(), libc::EACCES);

        let e = Error::Any(AnyError::new(TestError::AnError("any error".to_string())));
        assert_eq!(e.code(), libc::EIO);
        assert_eq!(e.to_string(), "any error");

        let e = Error::Plugin {
            name: "storage".to_string(),
            reason: "exit status 1".to_string(),
        };
        assert_eq!(e.code(), libc::EIO);
        assert_eq!(e.to_string(), "plugin storage: exit status 1");
    }
}
