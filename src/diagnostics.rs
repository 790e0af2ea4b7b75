//! The warning channel recoverable parse anomalies flow through.
//!
//! The core never writes to stdout; every non-fatal anomaly is reported
//! through a capability the host supplies, mirroring how PNG encoding and
//! other host-owned concerns are passed in rather than assumed.

/// One recoverable anomaly encountered while parsing or decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarnKind {
    /// An extended property named a type other than `Property`, `Canvas`,
    /// `Shape2D#Vector2D`, `Shape2D#Convex2D`, `Sound_DX8`, or `UOL`.
    UnknownExtendedType {
        /// The unrecognized type name.
        name: String,
        /// Byte offset of the extended property's length prefix.
        at: usize,
    },
    /// A canvas declared a pixel format id outside the seven known values.
    UnknownPixelFormat {
        /// The unrecognized format id.
        format: u32,
    },
    /// A directory entry used a discriminator byte other than 1, 2, 3, or 4.
    UnrecognizedDirectoryDiscriminator {
        /// The unrecognized discriminator byte.
        discriminator: u8,
        /// Byte offset of the entry.
        at: usize,
    },
    /// The inflater produced fewer bytes than the format's expected size
    /// before the input ran out.
    TruncatedPixelData {
        /// Bytes actually produced.
        produced: usize,
        /// Bytes expected for the canvas's width/height/format.
        expected: usize,
    },
    /// A directory entry was dropped during a walk (e.g. discriminator 1,
    /// which carries no name and produces no node).
    DroppedDirectoryEntry {
        /// Byte offset of the entry.
        at: usize,
    },
}

/// A sink for recoverable parse/decode anomalies.
///
/// Implement this to route warnings into a host's own logging or UI; the
/// default [`NullDiagnostics`] discards them.
pub trait Diagnostics {
    /// Called once per recoverable anomaly, in the order encountered.
    fn warn(&self, kind: WarnKind);
}

/// A [`Diagnostics`] implementation that discards every warning.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDiagnostics;

impl Diagnostics for NullDiagnostics {
    fn warn(&self, _kind: WarnKind) {}
}

impl<D: Diagnostics + ?Sized> Diagnostics for &D {
    fn warn(&self, kind: WarnKind) {
        (**self).warn(kind)
    }
}
