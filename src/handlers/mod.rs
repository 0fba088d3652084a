//! Handler modules for the KeyMux operator API.
//!
//! - `health` — health, readiness, auth mode, system stats
//! - `keys` — key listings, resets, verification, enable/disable, freeze
//! - `precheck` — precheck configuration and manual trigger
//! - `config` — runtime config read/update and key-list reload

pub mod config;
pub mod health;
pub mod keys;
pub mod precheck;

// Re-export everything (including utoipa __path_* types needed by OpenApi derive)
pub use config::*;
pub use health::*;
pub use keys::*;
pub use precheck::*;
