//! Search filter construction.

use dirlookup_core::USERNAME_PLACEHOLDER;
use ldap3::ldap_escape;

/// Builds the search filter for `username` from `template`.
///
/// Every occurrence of `__USERNAME__` is replaced; nothing else in the template
/// is interpreted. With `escape` set, RFC 4515 metacharacters in the username
/// are hex-escaped first so the value cannot change the filter's structure.
/// Replacement is a single pass, so a username that itself contains the
/// placeholder is inserted as-is.
#[must_use]
pub fn build_filter(template: &str, username: &str, escape: bool) -> String {
    if escape {
        template.replace(USERNAME_PLACEHOLDER, &ldap_escape(username))
    } else {
        template.replace(USERNAME_PLACEHOLDER, username)
    }
}
