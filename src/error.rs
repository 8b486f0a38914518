use crate::BranchId;

/// crate-wide error taxonomy. every variant is fatal at the process level;
/// the binaries log and abort on the first one they see.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error in {file}: {reason}")]
    Parse { file: String, reason: String },

    #[error("reference tree taxa missing from the reference MSA: {0:?}")]
    UnmatchedTaxon(Vec<String>),

    #[error("invalid character '{0}' for the configured alphabet")]
    InvalidCharacter(char),

    #[error("non-DNA data cannot be converted to 4-bit fasta (offending char: '{0}')")]
    UnsupportedAlphabet(char),

    #[error("sequence '{0}' does not appear to have any non-gap sites")]
    EmptySequence(String),

    #[error("-INF log-likelihood at branch {branch} with sequence '{header}'")]
    NumericalUnderflow { branch: BranchId, header: String },

    #[error("CLV {0} could not be materialized")]
    ClvUnavailable(usize),

    #[error("memory limit of {limit} is below the minimum required {minimum}")]
    MemoryInfeasible { limit: String, minimum: String },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn parse(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InternalInvariant(reason.into())
    }
}
