use thiserror::Error;

use crate::pe::{AlignError, PeError};

/// Everything that can stop an injection.  No variant leaves partial
/// output behind: callers only receive bytes on success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Input does not parse as a PE32+ image, or the header area cannot take
    /// the new section.
    #[error("{role} image: {source}")]
    Format {
        role: ImageRole,
        #[source]
        source: PeError,
    },
    /// A declared alignment is unusable or a computed address left the
    /// 32-bit range.
    #[error("alignment: {0}")]
    Alignment(#[from] AlignError),
    /// The payload was not built the way the requested checks demand.
    #[error("payload: {0}")]
    Payload(String),
}

/// Which input an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    Host,
    Payload,
}

impl std::fmt::Display for ImageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageRole::Host => write!(f, "host"),
            ImageRole::Payload => write!(f, "payload"),
        }
    }
}

impl Error {
    pub(crate) fn host(source: PeError) -> Self {
        Error::Format {
            role: ImageRole::Host,
            source,
        }
    }

    pub(crate) fn payload(source: PeError) -> Self {
        Error::Format {
            role: ImageRole::Payload,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
