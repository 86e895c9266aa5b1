//! LDAP lookups for mail user provisioning and login resolution.
//!
//! [`DirectoryLookup`] connects to a directory once, searches it with a filter
//! built from a template and the login name, and returns the normalized
//! attributes of the first matching entry. The [`hooks`] module maps those
//! attributes onto the records the mail host passes around when it creates
//! users and resolves logins.
//!
//! Lookups are an enrichment step: the hook handlers swallow lookup failures
//! after logging them, so a directory outage never blocks a login.

#![deny(missing_docs)]

mod entry;
mod filter;
pub mod hooks;
mod lookup;
mod session;

pub use dirlookup_core::{
    AttributeMapping, DirectoryConfig, Error, ErrorReport, HostConfig, Result, SearchScope,
};
pub use entry::{normalize_attributes, normalize_entry, RawAttribute, RawEntry, SearchResult};
pub use filter::build_filter;
pub use lookup::DirectoryLookup;
