use thiserror::Error;

/// Errors that abort a protection run. No partial output is ever written.
#[derive(Debug, Error)]
pub enum ProtectError {
    #[error("invalid input image: {0}")]
    InputInvalid(String),

    #[error("instruction at 0x{rva:08X} modifies eflags, not supported in this release")]
    UnsupportedInstruction { rva: u64 },

    #[error("unsupported fixup width: {0}")]
    FixupError(u8),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("image parsing failed: {0:?}")]
    Pe(exe::Error),
}

impl From<exe::Error> for ProtectError {
    fn from(error: exe::Error) -> Self {
        ProtectError::Pe(error)
    }
}

impl From<exe::PKError> for ProtectError {
    fn from(error: exe::PKError) -> Self {
        ProtectError::Pe(exe::Error::from(error))
    }
}
