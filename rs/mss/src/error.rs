//! The error kinds a [`crate::Session`] can surface. One variant per kind
//! named in the component design; no wrapping the same failure twice.

use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Structural or attribute error in the manifest XML, or a fragment URL
    /// template missing `{bitrate}`/`{start time}`.
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    /// Allocation failure, including buffer growth while reading the
    /// manifest. Rust allocation failures abort rather than return `Err`,
    /// so this variant exists for parity with the source behavior and is
    /// only raised by explicit capacity checks (oversized hex blobs, runaway
    /// buffer growth).
    #[error("out of memory")]
    OutOfMemory,

    /// Byte-source open/read/close, demuxer open, probe, or a seek onto a
    /// fragment that doesn't exist.
    #[error("io error: {0}")]
    IoError(Arc<anyhow::Error>),

    /// Byte-mode seek, or any seek while the session is live.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// The interrupt callback tripped during `AwaitReload` or an in-flight
    /// read.
    #[error("interrupted")]
    Interrupted,

    /// All active tracks exhausted in VOD mode.
    #[error("end of stream")]
    EndOfStream,
}

impl Error {
    pub fn manifest_invalid(msg: impl Into<String>) -> Self {
        Error::ManifestInvalid(msg.into())
    }

    pub fn io(err: impl Into<anyhow::Error>) -> Self {
        Error::IoError(Arc::new(err.into()))
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::ManifestInvalid(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Error::ManifestInvalid(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::ManifestInvalid(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::ManifestInvalid(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::ManifestInvalid(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::ManifestInvalid(err.to_string())
    }
}

impl From<mp4_atom::Error> for Error {
    fn from(err: mp4_atom::Error) -> Self {
        Error::io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
