//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → turned into DispatchSettings + RouteTable at startup
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → http server rebuilds the route table and swaps it atomically
//! ```
//!
//! # Design Decisions
//! - Only routes are hot-reloaded; dispatch settings need a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    DispatchConfig, HeaderConfig, ListenerConfig, LogFormat, ObservabilityConfig, ProxyConfig,
    RouteConfig, Strategy, TimeoutConfig, TlsConfig,
};
