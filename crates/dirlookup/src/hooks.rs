//! Host event handlers built on [`DirectoryLookup`].
//!
//! Each handler enriches a mutable event record. A lookup that finds nothing
//! or fails leaves the record untouched so the host falls back to its own
//! defaults; failures are logged here and never propagated.

use crate::entry::SearchResult;
use crate::lookup::DirectoryLookup;
use dirlookup_core::AttributeMapping;
use tracing::{debug, warn};

/// Identity record of a user created on first login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserCreateEvent {
    /// Login name of the new user
    pub user: String,
    /// Display name for the default identity
    pub user_name: Option<String>,
    /// Email address for the default identity
    pub user_email: Option<String>,
}

impl UserCreateEvent {
    /// Creates an event for `user` with no identity fields set.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }
}

/// Login name about to be authenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticateEvent {
    /// Username used for authentication
    pub user: String,
}

/// Email identity offered for a login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailIdentity {
    /// Email address in ASCII-compatible form
    pub email: String,
    /// Display name, empty when unknown
    pub name: String,
}

/// Resolution of a login name to its email identities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserToEmailEvent {
    /// Login name being resolved
    pub user: String,
    /// Email identities for the login
    pub email: Vec<EmailIdentity>,
}

/// Fills the display name and email of a newly created user.
pub async fn populate_identity(
    lookup: &mut DirectoryLookup,
    mapping: &AttributeMapping,
    event: &mut UserCreateEvent,
) {
    if let Some(result) = lookup_or_log(lookup, &event.user).await {
        apply_identity(&result, mapping, event);
    }
}

/// Replaces the email identities of a login with the directory's address.
pub async fn resolve_emails(
    lookup: &mut DirectoryLookup,
    mapping: &AttributeMapping,
    event: &mut UserToEmailEvent,
) {
    if let Some(result) = lookup_or_log(lookup, &event.user).await {
        apply_emails(&result, mapping, event);
    }
}

/// Rewrites the authentication username into the directory's email address.
pub async fn resolve_login(
    lookup: &mut DirectoryLookup,
    mapping: &AttributeMapping,
    event: &mut AuthenticateEvent,
) {
    if let Some(result) = lookup_or_log(lookup, &event.user).await {
        apply_login(&result, mapping, event);
    }
}

async fn lookup_or_log(lookup: &mut DirectoryLookup, user: &str) -> Option<SearchResult> {
    match lookup.search(user).await {
        Ok(Some(result)) => Some(result),
        Ok(None) => {
            debug!(%user, "no directory entry for user");
            None
        }
        Err(err) => {
            warn!(%user, code = err.error_code(), "directory lookup failed: {err}");
            None
        }
    }
}

fn apply_identity(result: &SearchResult, mapping: &AttributeMapping, event: &mut UserCreateEvent) {
    if let Some(name) = result.first(&mapping.name_attr) {
        event.user_name = Some(name.to_string());
    }
    if let Some(email) = result.first(&mapping.email_attr) {
        // An address starting with '@' has no local part.
        if email.find('@').is_some_and(|at| at > 0) {
            event.user_email = Some(idn_to_ascii(email));
        }
    }
}

fn apply_emails(result: &SearchResult, mapping: &AttributeMapping, event: &mut UserToEmailEvent) {
    if let Some(email) = result.first(&mapping.email_attr) {
        event.email = vec![EmailIdentity {
            email: idn_to_ascii(email),
            name: result
                .first(&mapping.name_attr)
                .unwrap_or_default()
                .to_string(),
        }];
    }
}

fn apply_login(result: &SearchResult, mapping: &AttributeMapping, event: &mut AuthenticateEvent) {
    if let Some(email) = result.first(&mapping.email_attr) {
        event.user = email.to_string();
    }
}

/// Converts the domain of an email address (or a bare domain) to its ASCII
/// form. The local part is kept as-is; input that fails conversion is
/// returned unchanged.
#[must_use]
pub fn idn_to_ascii(address: &str) -> String {
    let (local, domain) = match address.rsplit_once('@') {
        Some((local, domain)) => (Some(local), domain),
        None => (None, address),
    };
    if domain.is_ascii() {
        return address.to_string();
    }
    match idna::domain_to_ascii(domain) {
        Ok(ascii) => match local {
            Some(local) => format!("{local}@{ascii}"),
            None => ascii,
        },
        Err(err) => {
            debug!(%address, "IDN conversion failed: {err}");
            address.to_string()
        }
    }
}
