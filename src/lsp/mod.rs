// LSP protocol layer
// - server.rs: stdio server bootstrap and production wiring
// - proxy.rs: LanguageServer implementation routing calls to activations
// - host.rs: editor-backed workspace, settings and client adapters

pub mod host;
pub mod proxy;
pub mod server;
