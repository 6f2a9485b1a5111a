//! Chatlink - Main Library
//!
//! Connects applications to a DDP-style chat server over one persistent
//! WebSocket.
//!
//! ## Architecture
//!
//! - **ddp**: protocol client (re-exported from workspace)
//! - **config**: YAML + environment configuration for the client
//! - **bin_common**: Common utilities for binary executables (CLI, logging)
//!
//! ## Usage in Binaries
//!
//! ```rust,ignore
//! use chatlink::bin_common::{init_tracing, load_config_from_env, ConfigType};
//! use chatlink::config::ChatConfig;
//! ```

// Re-export workspace libraries for convenience
pub use ddp;

pub mod config;

// Binary common utilities
pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod logging;

    pub use cli::{load_config_from_env, parse_args, ConfigType};
    pub use logging::init_tracing;
}
