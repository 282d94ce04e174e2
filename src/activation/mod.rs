// Activation layer
// - types.rs: Variant, RuntimeIdentity, Scope, ScopeKey
// - error.rs: activation, manager and options errors
// - options.rs: analysis options provider (init payload + change detection)
// - manager.rs: per-scope backend lifecycle with debounced restart
// - fallback.rs: variant selection and fallback state machine
// - selector.rs: scope-keyed activation cache

pub mod error;
pub mod fallback;
pub mod manager;
pub mod options;
pub mod selector;
pub mod types;

pub use error::{ActivationError, ManagerError, OptionsError};
pub use fallback::{ActivationState, Backends, VariantServices};
pub use manager::Manager;
pub use options::{AnalysisOptions, AnalysisOptionsProvider, OptionsServices};
pub use selector::{ActivationFuture, ActivationRecord, ActivationResult, Selector};
pub use types::{RuntimeIdentity, Scope, ScopeKey, Variant};
