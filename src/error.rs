use thiserror::Error;

/// Result alias for the simulation core.
pub type Result<T> = std::result::Result<T, MarkowitzError>;

/// Failures raised by the return, leverage, matrix and optimizer stages.
///
/// Provider and CLI code wraps these in `anyhow` with the stage/instrument
/// that failed.
#[derive(Error, Debug)]
pub enum MarkowitzError {
    #[error("Invalid input: {context}")]
    InvalidInput { context: String },

    #[error("Length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error(
        "Leverage search for {instrument} did not converge on target {target} after {iterations} iterations (flat or unreachable return series)"
    )]
    DegenerateSeries {
        instrument: String,
        iterations: usize,
        target: f64,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MarkowitzError {
    pub fn invalid_input(context: impl Into<String>) -> Self {
        Self::InvalidInput {
            context: context.into(),
        }
    }

    pub fn length_mismatch(expected: usize, actual: usize) -> Self {
        Self::LengthMismatch { expected, actual }
    }
}

/// Non-fatal numeric conditions observed during a simulation run.
#[derive(Clone, Debug, PartialEq)]
pub enum NumericWarning {
    /// A sampled portfolio had zero volatility; its Sharpe ratio was set to
    /// a signed infinity (or 0.0 when the return was zero too).
    ZeroVolatility { samples: usize },
    /// The return covariance matrix is not positive definite.
    SingularCovariance,
}

impl std::fmt::Display for NumericWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroVolatility { samples } => {
                write!(f, "{} sampled portfolio(s) had zero volatility", samples)
            }
            Self::SingularCovariance => write!(f, "covariance matrix is singular"),
        }
    }
}
