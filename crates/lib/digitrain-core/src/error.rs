use thiserror::Error;

/// Every failure the training pipeline can surface. None of them are recovered locally, the
/// caller is expected to log the error and stop the run.
#[derive(Debug, Error)]
pub enum TrainError {
    /// The dataset could not be fetched, decoded or indexed.
    #[error("dataset unavailable: {0}")]
    DataUnavailable(String),

    /// Invalid or incompatible hyperparameters, detected before training starts.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Not enough devices or device memory for the requested workers.
    #[error("accelerator resources exhausted: {0}")]
    ResourceExhaustion(String),

    /// Numeric failure while training, such as a non-finite loss.
    #[error("computation failed: {0}")]
    Computation(String),
}

pub type TrainResult<T> = Result<T, TrainError>;

impl TrainError {
    pub fn config(message: impl Into<String>) -> Self {
        TrainError::Configuration(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        TrainError::DataUnavailable(message.into())
    }
}
