// Backend instances
// - mod.rs: BackendInstance / BackendFactory traits and BackendError
// - codec.rs: Content-Length framing for JSON-RPC over stdio
// - connection.rs: request/response bookkeeping over one server process
// - process.rs: ProcessBackend, a language server child process

pub mod codec;
pub mod connection;
pub mod process;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::activation::options::AnalysisOptions;
use crate::activation::types::{Scope, Variant};
use crate::middleware::{CallResult, Handler, Middleware, ProtocolCall};

pub use process::{ProcessBackend, ProcessBackendFactory, ServerCommand};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Server rejected {method}: {message}")]
    Rejected { method: String, message: String },

    #[error("Connection to server closed")]
    ConnectionClosed,

    #[error("Backend is not started")]
    NotStarted,

    #[error("Backend start failed: {0}")]
    Start(String),
}

/// One running language server serving one scope.
#[async_trait]
pub trait BackendInstance: Send + Sync {
    fn variant(&self) -> Variant;

    /// Middleware every host-originated call passes through.
    fn middleware(&self) -> Arc<Middleware>;

    /// Handler that delivers a call to the server itself.
    fn terminal(&self) -> Handler;

    async fn start(&self, options: AnalysisOptions) -> Result<(), BackendError>;

    async fn dispose(&self) -> Result<(), BackendError>;

    /// Sends a host call through the middleware to the server.
    async fn handle(&self, call: ProtocolCall) -> CallResult {
        self.middleware().intercept(call, self.terminal()).await
    }
}

/// Creates fresh instances of one variant.
pub trait BackendFactory: Send + Sync {
    fn variant(&self) -> Variant;

    fn create(&self, scope: &Scope) -> Result<Arc<dyn BackendInstance>, BackendError>;
}
