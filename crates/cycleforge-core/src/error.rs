use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration Error: {0}")]
    BadConfig(String),

    #[error("State Error: {0}")]
    BadState(String),

    #[error("Assembly contains unresolved markers: {0}")]
    AssembleUndefined(String),

    #[error("Measurement reported diverging candidate outputs")]
    MeasureIncorrect,

    #[error("Candidate failed to assemble: {0}")]
    MeasureInvalid(String),

    #[error("Measurement failed: {0}")]
    MeasureGeneric(String),

    #[error("Proof failed: {0}")]
    ProofUnsuccessful(String),
}

impl ForgeError {
    /// Stable process exit code for each failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            ForgeError::BadConfig(_) => 16,
            ForgeError::MeasureIncorrect => 12,
            ForgeError::MeasureInvalid(_) => 13,
            ForgeError::MeasureGeneric(_) => 14,
            ForgeError::ProofUnsuccessful(_) => 15,
            // Parse-adjacent and unrecoverable internal failures share the
            // parameter failure code so wrapper scripts see a single bucket.
            _ => 11,
        }
    }
}

pub const EXIT_PARAMETER_PARSE_FAIL: i32 = 11;

pub type ForgeResult<T> = Result<T, ForgeError>;
