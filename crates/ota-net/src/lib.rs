//! ---
//! ota_section: "05-networking-external-interfaces"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "HTTP collaborators for the update agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! HTTP implementations of the engine's collaborator traits.
//!
//! Every request carries the [`headers::DeviceHeaders`] identifying the
//! device; build the shared client with [`headers::build_client`].
#![warn(missing_docs)]

pub mod headers;
pub mod metadata;
pub mod package;
pub mod report;

use std::path::PathBuf;

pub use headers::{build_client, DeviceHeaders};
pub use metadata::{parse_targets, HttpMetadataSource, TARGETS_FILE};
pub use package::ImagePackageManager;
pub use report::{HttpReportSink, ReportQueue, MAX_BACKLOG};

/// Errors raised by the HTTP collaborators.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Transport-level failure.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("{url} returned HTTP {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// Response status code.
        status: u16,
    },
    /// A configured endpoint is not a valid URL.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// A device header value contains forbidden characters.
    #[error("invalid header {name}: {reason}")]
    Header {
        /// Header name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// Metadata body could not be decoded.
    #[error("malformed metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    /// Filesystem failure under the storage directory.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A required endpoint is missing from the configuration.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// Convenience alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, NetError>;

pub(crate) fn io_error(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> NetError {
    let path = path.into();
    move |source| NetError::Io { path, source }
}

/// Join `path` onto `base` without dropping the last segment of `base`.
pub(crate) fn endpoint(base: &str, path: &str) -> Result<url::Url> {
    let joined = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Ok(url::Url::parse(&joined)?)
}
