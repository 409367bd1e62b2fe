pub mod canonical;
pub mod config;
pub mod error;
pub mod providers;
pub mod router;
pub mod server;
pub mod storage;
pub mod translate;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use router::{ModelRouter, ProviderRegistry};
pub use server::{build_router, AppState};
pub use storage::StorageService;
