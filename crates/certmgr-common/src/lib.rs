//! ---
//! certmgr_section: "01-core-functionality"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Shared primitives and utilities for the controller runtime."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
//! Shared primitives for the certmgr workspace.
//! This crate exposes configuration loading and logging setup consumed by
//! the daemon and the integration suites.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, BusConfig, InstallConfig, LoadedAppConfig, LoggingConfig, MetricsConfig,
    RequesterConfig,
};
pub use logging::{init_tracing, LogFormat};
