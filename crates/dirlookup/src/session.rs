//! Directory transport: the connector/session seam and its `ldap3` backend.

use crate::entry::{RawAttribute, RawEntry};
use async_trait::async_trait;
use dirlookup_core::{DirectoryConfig, Error, Result, SearchScope};
use ldap3::asn1::StructureTag;
use ldap3::{
    LdapConnAsync, LdapConnSettings, LdapError, LdapResult, ResultEntry, Scope, SearchOptions,
};
use native_tls::{Certificate, TlsConnector};
use std::fs;
use std::sync::Arc;

/// Attribute selector that returns every user attribute.
const ALL_USER_ATTRIBUTES: &[&str] = &["*"];

/// Search result entry application tag.
const SEARCH_RESULT_ENTRY: u64 = 4;

/// Result code for rejected credentials.
const INVALID_CREDENTIALS: u32 = 49;

/// Result code for a search cut short by the server's size limit.
const SIZE_LIMIT_EXCEEDED: u32 = 4;

/// An open connection to the directory server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait DirectorySession: Send {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()>;
    async fn search(
        &mut self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
    ) -> Result<Vec<RawEntry>>;
    async fn unbind(&mut self) -> Result<()>;
}

/// Opens connections, including StartTLS negotiation when configured.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait DirectoryConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>>;
}

/// Connector backed by `ldap3`.
pub(crate) struct LdapConnector {
    config: Arc<DirectoryConfig>,
}

impl LdapConnector {
    pub(crate) fn new(config: Arc<DirectoryConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>> {
        let settings = build_ldap_settings(&self.config)?;
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &self.config.uri)
            .await
            .map_err(|err| Error::ConnectionError(format!("{}: {err}", self.config.uri)))?;
        ldap3::drive!(conn);
        Ok(Box::new(LdapSession { inner: ldap }))
    }
}

struct LdapSession {
    inner: ldap3::Ldap,
}

#[async_trait]
impl DirectorySession for LdapSession {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let result = self
            .inner
            .simple_bind(dn, password)
            .await
            .map_err(|err| Error::ConnectionError(err.to_string()))?;
        if result.rc == INVALID_CREDENTIALS {
            return Err(Error::BindError(format!("invalid credentials for `{dn}`")));
        }
        result
            .success()
            .map_err(|err| Error::BindError(err.to_string()))?;
        Ok(())
    }

    async fn search(
        &mut self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
    ) -> Result<Vec<RawEntry>> {
        // Only the first match is used.
        let ldap3::SearchResult(entries, result) = self
            .inner
            .with_search_options(SearchOptions::new().sizelimit(1))
            .search(base_dn, ldap_scope(scope), filter, ALL_USER_ATTRIBUTES)
            .await
            .map_err(search_failure)?;

        let mut decoded = Vec::with_capacity(entries.len());
        for entry in accepted_entries(entries, result)? {
            if let Some(raw) = decode_entry(entry)? {
                decoded.push(raw);
            }
        }
        Ok(decoded)
    }

    async fn unbind(&mut self) -> Result<()> {
        self.inner
            .unbind()
            .await
            .map_err(|err| Error::ConnectionError(err.to_string()))
    }
}

/// Maps a failed search request. A broken transport becomes a
/// `ConnectionError` so the caller knows the session is gone.
fn search_failure(err: LdapError) -> Error {
    match err {
        LdapError::Io { .. }
        | LdapError::EndOfStream
        | LdapError::OpSend { .. }
        | LdapError::ResultRecv { .. }
        | LdapError::IdScrubSend { .. } => Error::ConnectionError(err.to_string()),
        other => Error::SearchError(other.to_string()),
    }
}

/// Checks the search result code. `sizeLimitExceeded` still carries the
/// entries returned before the limit hit, so it counts as success when at
/// least one entry arrived.
fn accepted_entries(entries: Vec<ResultEntry>, result: LdapResult) -> Result<Vec<ResultEntry>> {
    match result.rc {
        0 => Ok(entries),
        SIZE_LIMIT_EXCEEDED if !entries.is_empty() => Ok(entries),
        rc => Err(Error::SearchError(format!(
            "rc={rc}, dn: \"{}\", text: \"{}\"",
            result.matched, result.text
        ))),
    }
}

fn ldap_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Subtree => Scope::Subtree,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Base => Scope::Base,
    }
}

fn build_ldap_settings(config: &DirectoryConfig) -> Result<LdapConnSettings> {
    let mut settings = LdapConnSettings::new()
        .set_conn_timeout(config.connect_timeout())
        .set_starttls(config.use_tls);

    if !config.tls_verify {
        tracing::warn!(
            uri = %config.uri,
            "TLS verification disabled for directory connection"
        );
        settings = settings.set_no_tls_verify(true);
    } else if let Some(cert_path) = &config.tls_ca_cert {
        let pem = fs::read(cert_path).map_err(|err| {
            Error::ConfigError(format!(
                "failed to read directory CA certificate {}: {err}",
                cert_path.display()
            ))
        })?;
        let certificate = Certificate::from_pem(&pem).map_err(|err| {
            Error::ConfigError(format!("invalid directory CA certificate: {err}"))
        })?;
        let connector = TlsConnector::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|err| {
                Error::ConfigError(format!("failed to build TLS connector: {err}"))
            })?;
        settings = settings.set_connector(connector);
    }

    Ok(settings)
}

/// Decodes a search result entry, keeping attribute order and an explicit
/// value count. Referrals and intermediate messages yield `None`.
fn decode_entry(entry: ResultEntry) -> Result<Option<RawEntry>> {
    let Some(parts) = entry
        .0
        .match_id(SEARCH_RESULT_ENTRY)
        .and_then(StructureTag::expect_constructed)
    else {
        return Ok(None);
    };
    let mut parts = parts.into_iter();

    let dn = parts
        .next()
        .and_then(StructureTag::expect_primitive)
        .map(lossy_string)
        .ok_or_else(|| malformed("entry has no DN"))?;
    let attribute_tags = parts
        .next()
        .and_then(StructureTag::expect_constructed)
        .ok_or_else(|| malformed("entry has no attribute list"))?;

    let mut attributes = Vec::with_capacity(attribute_tags.len());
    for tag in attribute_tags {
        let mut pieces = tag
            .expect_constructed()
            .ok_or_else(|| malformed("attribute is not a sequence"))?
            .into_iter();
        let name = pieces
            .next()
            .and_then(StructureTag::expect_primitive)
            .map(lossy_string)
            .ok_or_else(|| malformed("attribute has no type"))?;
        let values = pieces
            .next()
            .and_then(StructureTag::expect_constructed)
            .ok_or_else(|| malformed("attribute has no value set"))?
            .into_iter()
            .map(|value| {
                value
                    .expect_primitive()
                    .map(lossy_string)
                    .ok_or_else(|| malformed("attribute value is not an octet string"))
            })
            .collect::<Result<Vec<_>>>()?;
        attributes.push(RawAttribute::new(name, values));
    }

    Ok(Some(RawEntry { dn, attributes }))
}

fn lossy_string(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(value) => value,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

fn malformed(what: &str) -> Error {
    Error::SearchError(format!("malformed search result: {what}"))
}
