//! # dirlookup-core
//!
//! Shared types for looking up mail users in an LDAP directory.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy and the report shape handed to the host
//! - [`config`] - Directory connection settings and per-consumer attribute mappings

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;

pub use config::{
    AttributeMapping, DirectoryConfig, HostConfig, SearchScope, USERNAME_PLACEHOLDER,
};
pub use error::{Error, ErrorReport, Result};
