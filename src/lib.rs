pub mod activation;
pub mod backend;
pub mod config;
pub mod debounce;
pub mod host;
pub mod log;
pub mod lsp;
pub mod middleware;
pub mod telemetry;
