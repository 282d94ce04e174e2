use thiserror::Error;

use crate::activation::types::Variant;
use crate::backend::BackendError;
use crate::host::InstallError;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("Analysis options requested before initialize()")]
    NotInitialized,

    #[error("Failed to read environment variables: {0}")]
    Environment(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Manager already started")]
    AlreadyStarted,

    #[error("Manager has been disposed")]
    Disposed,

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("No active interpreter for {0}")]
    NoRuntime(String),

    #[error("Failed to resolve interpreter: {0}")]
    Runtime(anyhow::Error),

    #[error("No {0} backend is registered")]
    NoBackend(Variant),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("Failed to start {variant} backend: {source}")]
    Start {
        variant: Variant,
        #[source]
        source: ManagerError,
    },

    #[error("Activation task aborted: {0}")]
    Aborted(String),
}
