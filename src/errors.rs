use thiserror::Error;

/// Failures the builder can report through its [`Diagnostics`] sink.
///
/// The builder itself never returns these as `Err` across the public API;
/// the first one recorded makes the run fatal and is surfaced via
/// `CacheBuilder::error_message`.
///
/// [`Diagnostics`]: crate::diagnostics::Diagnostics
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("tool was built without support for: '{0}'")]
    UnsupportedArchitecture(String),

    #[error("could not allocate cache buffer")]
    AllocationFailure,

    /// Fewer than the required minimum number of dylibs survived gathering
    /// and verification.
    #[error("missing required minimum set of dylibs ({0} admitted)")]
    TooFewDylibs(usize),

    /// A binary the caller marked as required could not be placed in the
    /// cache. Ordinary missing dependencies only demote a dylib with a
    /// warning; this is the fatal form.
    #[error("Required binary was not included in the shared cache '{path}' because: {reason}")]
    DependencyMissing { path: String, reason: String },

    #[error("cache overflow by {0}MB")]
    CacheOverflow(u64),

    /// The extras pool index ran out of bits, or the emitted slide info
    /// did not fit its reservation.
    #[error("{0}")]
    SlideInfoOverflow(&'static str),

    /// A rebase slot does not hold a cache-relative pointer, so no delta
    /// chain can be threaded through it.
    #[error(
        "rebase pointer does not point within cache. lastOffset=0x{last_offset:04X}, seg={segment}, dylib={dylib}"
    )]
    RebaseOutOfRange {
        last_offset: u16,
        segment: String,
        dylib: String,
    },

    #[error("codeSigningDigestMode has unknown, unexpected value")]
    SigningConfigInvalid,

    #[error("could not write file {path}: {source}")]
    WriteFailed {
        path: String,
        source: std::io::Error,
    },

    /// An external collaborator (segment adjuster or closure binder)
    /// reported a per-image failure; the first such failure is promoted
    /// after the phase completes.
    #[error("{0}")]
    Collaborator(String),
}
