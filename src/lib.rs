// src/lib.rs

// Import the top-level `tradecouncil` module.
pub mod tradecouncil;

// Re-exporting key items for easier external access.
pub use tradecouncil::adapter::{ProviderAdapter, TaskOptions, TaskResult, TaskSpec, TokenUsage};
pub use tradecouncil::catalog::{Capability, ModelCatalog, ModelKind, ModelSpec, Provider};
pub use tradecouncil::coordinator::{CollaborationMode, CollaborationResult, Coordinator};
pub use tradecouncil::error::{ErrorKind, TaskError};
pub use tradecouncil::manager::{ModelManager, TaskContext};
pub use tradecouncil::orchestrator::{AnalysisConfig, AnalysisRun, Market, Orchestrator};
pub use tradecouncil::progress::{ProgressSnapshot, RunStatus};
pub use tradecouncil::routing::{ModelSelection, RoutingStrategy, SmartRouter};

// Convenience path aliases mirroring the module layout.
pub use tradecouncil::adapter;
pub use tradecouncil::adapters;
pub use tradecouncil::catalog;
pub use tradecouncil::config;
pub use tradecouncil::coordinator;
pub use tradecouncil::error;
pub use tradecouncil::lifecycle;
pub use tradecouncil::manager;
pub use tradecouncil::orchestrator;
pub use tradecouncil::progress;
pub use tradecouncil::roles;
pub use tradecouncil::routing;
pub use tradecouncil::store;
pub use tradecouncil::usage;
