use thiserror::Error;

/// Failures the harness classifies itself. Anything else travels as a plain
/// `anyhow::Error` and fails the case as-is.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("incorrect test case `{row}`: {detail}")]
    Config { row: String, detail: String },

    #[error("unsupported input type for `{input}`: {dtype}")]
    UnsupportedType { input: String, dtype: String },

    #[error("no signatures for a model {model}, url {link}")]
    MissingSignature { model: String, link: String },

    #[error("output mismatch: {0}")]
    OutputMismatch(String),

    #[error("`{program}` exited with {status}")]
    Subprocess { program: String, status: String },
}
