use std::{borrow::Cow, fmt::Display};

/// The error type of the crate.
#[derive(Debug)]
pub enum Error {
    /// The fixed `"PKG1"` magic at byte 0 was not found, or another fixed-layout
    /// header field did not match.
    MalformedHeader(Cow<'static, str>),
    /// No regional variant (GMS/EMS/BMS), or the one supplied, produced a valid parse.
    UnsupportedVariant,
    /// Auto-detection exhausted every candidate patch version without success.
    VersionDetectionFailed,
    /// A primitive read ran past the end of the buffer.
    TruncatedInput {
        /// Byte offset at which the read was attempted.
        at: usize,
    },
    /// A generic parse failure at a specific byte offset.
    Decode {
        /// Byte offset at which the failure was detected.
        at: usize,
        /// Human-readable description.
        message: Cow<'static, str>,
    },
    /// The deflate stream could not be inflated at all (not merely truncated).
    InflateError,
    /// A canvas referenced a pixel format outside the seven known ids, and no
    /// caller-acceptable fallback was possible.
    UnknownPixelFormat(u32),
    /// The writer's verbatim fast path was requested with layout parameters
    /// (data-section start or version hash) that differ from the source buffer.
    MismatchedLayoutParameters,
    /// A modified canvas had no decoded pixels and no original payload to fall
    /// back to, so the writer had nothing to emit.
    CanvasPayloadMissing,
    /// Wrapped I/O error from an underlying `Read`/`Write`/`Seek` operation.
    Io(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl Error {
    #[inline]
    pub(crate) fn decode(at: usize, message: impl Into<Cow<'static, str>>) -> Self {
        Self::Decode {
            at,
            message: message.into(),
        }
    }

    #[inline]
    pub(crate) fn malformed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::MalformedHeader(message.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedHeader(msg) => write!(f, "malformed archive header: {msg}"),
            Self::UnsupportedVariant => write!(f, "no supported regional variant matched"),
            Self::VersionDetectionFailed => write!(f, "could not detect archive patch version"),
            Self::TruncatedInput { at } => write!(f, "truncated input at offset {at}"),
            Self::Decode { at, message } => write!(f, "decode error at offset {at}: {message}"),
            Self::InflateError => write!(f, "inflate failed before producing any output"),
            Self::UnknownPixelFormat(id) => write!(f, "unknown pixel format id {id}"),
            Self::MismatchedLayoutParameters => write!(
                f,
                "fast-path write requested with a data-section start or version hash \
                 that differs from the source buffer"
            ),
            Self::CanvasPayloadMissing => write!(
                f,
                "modified canvas has no decoded pixels and no original payload to copy"
            ),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

pub(crate) type Result<T> = std::result::Result<T, Error>;
