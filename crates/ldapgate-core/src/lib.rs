//! # ldapgate-core
//!
//! Core types and utilities for the ldapgate directory-management gateway.
//!
//! This crate provides the error taxonomy with its HTTP mapping, the typed
//! and validated cluster configuration model, runtime settings resolved from
//! the environment, and the shared domain types used by the LDAP and
//! directory-service crates.
//!
//! ## Modules
//!
//! - [`error`] - Error kinds and HTTP status code mapping
//! - [`config`] - Cluster topology and per-cluster policy model
//! - [`settings`] - Environment-derived runtime settings
//! - [`types`] - Operation classes, views, entries and page envelopes
//! - [`telemetry`] - Structured logging setup

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod settings;
pub mod telemetry;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
