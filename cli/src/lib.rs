//! stagecraft - environment configuration and promotion pipelines
//!
//! Declares per-environment settings (database capacity, compute scaling,
//! idle suspend, backups), validates them once, and promotes an application
//! through an ordered list of stages with optional manual gates. Resource
//! creation is delegated to a [`infrastructure::ProvisioningBackend`].

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod observability;
pub mod services;
