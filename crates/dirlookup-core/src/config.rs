//! Configuration structures for directory lookups.
//!
//! The host supplies one JSON document at startup. It is deserialized into a
//! [`HostConfig`], validated once, and never mutated afterwards; lookups share
//! the [`DirectoryConfig`] read-only.

use crate::Error;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;
use validator::Validate;

/// Token in [`DirectoryConfig::filter_expr`] that is replaced by the username.
pub const USERNAME_PLACEHOLDER: &str = "__USERNAME__";

/// The only LDAP protocol version the client speaks.
pub const SUPPORTED_PROTOCOL_VERSION: u32 = 3;

/// Default connect, StartTLS and bind timeout (seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Default search timeout (seconds).
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 10;

/// Breadth of a search relative to the base DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    /// The base entry and everything below it.
    #[serde(rename = "sub", alias = "subtree")]
    Subtree,
    /// Immediate children of the base entry.
    #[serde(alias = "one")]
    OneLevel,
    /// The base entry itself.
    Base,
}

impl SearchScope {
    /// Host configuration spelling of the scope.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subtree => "sub",
            Self::OneLevel => "onelevel",
            Self::Base => "base",
        }
    }
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sub" | "subtree" => Ok(Self::Subtree),
            "onelevel" | "one" => Ok(Self::OneLevel),
            "base" => Ok(Self::Base),
            other => Err(Error::ConfigError(format!(
                "unrecognized search scope `{other}` (expected sub, onelevel or base)"
            ))),
        }
    }
}

/// Connection and search settings for one directory.
#[derive(Debug, Deserialize, Validate)]
pub struct DirectoryConfig {
    /// Server address, e.g. `ldap://ldap.example.com:389`.
    #[validate(length(min = 1))]
    pub uri: String,

    /// LDAP protocol version. Only version 3 is supported.
    #[validate(range(min = 3, max = 3))]
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,

    /// Negotiate StartTLS before binding.
    #[serde(default)]
    pub use_tls: bool,

    /// Bind DN. Empty together with an empty password means an anonymous bind.
    #[serde(default)]
    pub bind_dn: String,

    /// Bind password.
    #[serde(default = "empty_secret")]
    pub password: SecretString,

    /// Search base.
    pub base_dn: String,

    /// Search scope.
    pub scope: SearchScope,

    /// Search filter containing [`USERNAME_PLACEHOLDER`].
    #[validate(length(min = 1))]
    pub filter_expr: String,

    /// Escape filter metacharacters in the username before substitution.
    ///
    /// Turning this off substitutes the username verbatim, which lets a crafted
    /// login name rewrite the filter. Only disable it when the host depends on
    /// that behaviour.
    #[serde(default = "default_escape_username")]
    pub escape_username: bool,

    /// Verify the server certificate during TLS.
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,

    /// Optional path to a PEM CA certificate for TLS.
    #[serde(default)]
    pub tls_ca_cert: Option<PathBuf>,

    /// Timeout for connect, StartTLS and bind, in seconds.
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Timeout for a single search, in seconds.
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

const fn default_protocol_version() -> u32 {
    SUPPORTED_PROTOCOL_VERSION
}

const fn default_escape_username() -> bool {
    true
}

const fn default_tls_verify() -> bool {
    true
}

const fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

const fn default_operation_timeout_secs() -> u64 {
    DEFAULT_OPERATION_TIMEOUT_SECS
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

impl DirectoryConfig {
    /// Creates a subtree-scoped configuration with an anonymous bind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the URI is not an LDAP URI or the
    /// filter is empty.
    pub fn new(
        uri: impl Into<String>,
        base_dn: impl Into<String>,
        filter_expr: impl Into<String>,
    ) -> Result<Self, Error> {
        let config = Self {
            uri: uri.into(),
            protocol_version: default_protocol_version(),
            use_tls: false,
            bind_dn: String::new(),
            password: empty_secret(),
            base_dn: base_dn.into(),
            scope: SearchScope::Subtree,
            filter_expr: filter_expr.into(),
            escape_username: default_escape_username(),
            tls_verify: default_tls_verify(),
            tls_ca_cert: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
        };
        config.check()?;
        Ok(config)
    }

    /// Sets the bind credentials.
    #[must_use]
    pub fn with_bind(mut self, bind_dn: impl Into<String>, password: impl Into<String>) -> Self {
        self.bind_dn = bind_dn.into();
        self.password = SecretString::from(password.into());
        self
    }

    /// Sets the search scope.
    #[must_use]
    pub const fn with_scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    /// Enables or disables StartTLS.
    #[must_use]
    pub const fn with_start_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Enables or disables escaping of the username in the filter.
    #[must_use]
    pub const fn with_username_escaping(mut self, escape: bool) -> Self {
        self.escape_username = escape;
        self
    }

    /// Enables or disables TLS certificate verification.
    #[must_use]
    pub const fn with_tls_verification(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    /// Sets the custom CA certificate path.
    #[must_use]
    pub fn with_tls_ca_cert(mut self, path: PathBuf) -> Self {
        self.tls_ca_cert = Some(path);
        self
    }

    /// Overrides the connect timeout in seconds.
    #[must_use]
    pub const fn with_connect_timeout_secs(mut self, seconds: u64) -> Self {
        self.connect_timeout_secs = seconds;
        self
    }

    /// Overrides the search timeout in seconds.
    #[must_use]
    pub const fn with_operation_timeout_secs(mut self, seconds: u64) -> Self {
        self.operation_timeout_secs = seconds;
        self
    }

    /// Connect, StartTLS and bind timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Search timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Returns true when no bind DN is configured.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.bind_dn.is_empty()
    }

    /// Validates field ranges and the URI scheme.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] describing the first problem found.
    pub fn check(&self) -> Result<(), Error> {
        self.validate()?;
        let url = Url::parse(&self.uri)?;
        if !matches!(url.scheme(), "ldap" | "ldaps" | "ldapi") {
            return Err(Error::ConfigError(format!(
                "unsupported directory URI scheme `{}`",
                url.scheme()
            )));
        }
        if self.use_tls && url.scheme() == "ldaps" {
            return Err(Error::ConfigError(
                "StartTLS cannot be combined with an ldaps:// URI".to_string(),
            ));
        }
        if !self.filter_expr.contains(USERNAME_PLACEHOLDER) {
            tracing::warn!(
                filter = %self.filter_expr,
                placeholder = USERNAME_PLACEHOLDER,
                "directory filter has no username placeholder; every lookup runs the same search"
            );
        }
        Ok(())
    }
}

/// Attribute names a consumer reads from a search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMapping {
    /// Attribute holding the display name
    #[serde(default = "default_name_attr")]
    pub name_attr: String,

    /// Attribute holding the email address
    #[serde(default = "default_email_attr")]
    pub email_attr: String,
}

fn default_name_attr() -> String {
    "name".to_string()
}

fn default_email_attr() -> String {
    "email".to_string()
}

impl AttributeMapping {
    /// Creates a mapping with explicit attribute names.
    #[must_use]
    pub fn new(name_attr: impl Into<String>, email_attr: impl Into<String>) -> Self {
        Self {
            name_attr: name_attr.into(),
            email_attr: email_attr.into(),
        }
    }
}

impl Default for AttributeMapping {
    fn default() -> Self {
        Self {
            name_attr: default_name_attr(),
            email_attr: default_email_attr(),
        }
    }
}

/// Configuration document supplied by the host.
#[derive(Debug, Deserialize)]
pub struct HostConfig {
    /// Directory connection settings
    pub directory: DirectoryConfig,

    /// Attributes used when populating a new user's identity
    #[serde(default)]
    pub new_user_identity: AttributeMapping,

    /// Attributes used when resolving a login to an email address
    #[serde(default)]
    pub login_resolution: AttributeMapping,
}

impl HostConfig {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] on malformed JSON, unknown scopes,
    /// missing required fields or failed validation.
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)?;
        config.directory.check()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            Error::ConfigError(format!(
                "failed to read directory configuration {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&json)
    }
}
