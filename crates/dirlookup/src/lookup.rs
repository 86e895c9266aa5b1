//! The directory lookup: connect once, search per username, normalize the
//! first match.

use crate::entry::{normalize_entry, SearchResult};
use crate::filter::build_filter;
use crate::session::{DirectoryConnector, DirectorySession, LdapConnector};
use dirlookup_core::{DirectoryConfig, Error, Result};
use secrecy::ExposeSecret;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Looks up mail users in a directory.
///
/// The instance owns at most one bound connection. It is opened on the first
/// [`search`](Self::search) (or an explicit [`connect`](Self::connect)) and
/// reused afterwards. Methods take `&mut self`, so one instance never runs two
/// operations at once; wrap it in a mutex to share it between tasks.
pub struct DirectoryLookup {
    config: Arc<DirectoryConfig>,
    connector: Box<dyn DirectoryConnector>,
    session: Option<Box<dyn DirectorySession>>,
}

impl DirectoryLookup {
    /// Creates a lookup that talks to the configured server through `ldap3`.
    ///
    /// No connection is made until the first search.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the configuration fails validation.
    pub fn new(config: Arc<DirectoryConfig>) -> Result<Self> {
        config.check()?;
        let connector: Box<dyn DirectoryConnector> = Box::new(LdapConnector::new(config.clone()));
        Ok(Self {
            config,
            connector,
            session: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_connector(
        config: DirectoryConfig,
        connector: Box<dyn DirectoryConnector>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            session: None,
        }
    }

    /// Shared configuration.
    #[must_use]
    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Returns true once a bound connection has been established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Connects and binds unless a bound connection already exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionError`] if the server is unreachable or
    /// StartTLS fails, and [`Error::BindError`] if the credentials are rejected.
    /// The connection stays unset so a later call can try again.
    pub async fn connect(&mut self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    /// Searches for `username` and returns the first matching entry.
    ///
    /// Returns `Ok(None)` when nothing matches. Further matches beyond the
    /// first are ignored.
    ///
    /// # Errors
    ///
    /// Returns the connect/bind errors of [`connect`](Self::connect), or
    /// [`Error::SearchError`] if the search request fails or times out. A
    /// search that fails because the connection dropped also forgets the
    /// session, so the next call reconnects.
    pub async fn search(&mut self, username: &str) -> Result<Option<SearchResult>> {
        if username.is_empty() {
            debug!("empty username; skipping directory search");
            return Ok(None);
        }

        let config = Arc::clone(&self.config);
        let filter = build_filter(&config.filter_expr, username, config.escape_username);
        debug!(base_dn = %config.base_dn, scope = %config.scope, %filter, "searching directory");

        let session = self.session().await?;
        let entries = match with_timeout(
            config.operation_timeout(),
            session.search(&config.base_dn, config.scope, &filter),
            || Error::SearchError("directory search timed out".to_string()),
        )
        .await
        {
            Ok(entries) => entries,
            Err(Error::ConnectionError(reason)) => {
                warn!(uri = %config.uri, "directory connection lost during search: {reason}");
                self.session = None;
                return Err(Error::SearchError(format!("connection lost: {reason}")));
            }
            Err(err) => return Err(err),
        };

        debug!(matches = entries.len(), "directory search finished");
        Ok(entries.into_iter().next().map(normalize_entry))
    }

    /// Unbinds and drops the connection, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionError`] if the unbind request fails. The
    /// connection is dropped either way.
    pub async fn close(&mut self) -> Result<()> {
        match self.session.take() {
            Some(mut session) => session.unbind().await,
            None => Ok(()),
        }
    }

    async fn session(&mut self) -> Result<&mut Box<dyn DirectorySession>> {
        let session = match self.session.take() {
            Some(session) => session,
            None => self.establish().await?,
        };
        Ok(self.session.insert(session))
    }

    async fn establish(&self) -> Result<Box<dyn DirectorySession>> {
        let config = &self.config;
        let connect_timeout = config.connect_timeout();

        let mut session = with_timeout(connect_timeout, self.connector.connect(), || {
            Error::ConnectionError(format!("connecting to {} timed out", config.uri))
        })
        .await
        .map_err(|err| {
            warn!(uri = %config.uri, code = err.error_code(), "{err}");
            err
        })?;

        let bound = with_timeout(
            connect_timeout,
            session.simple_bind(&config.bind_dn, config.password.expose_secret()),
            || Error::ConnectionError(format!("bind to {} timed out", config.uri)),
        )
        .await;

        if let Err(err) = bound {
            warn!(uri = %config.uri, bind_dn = %config.bind_dn, code = err.error_code(), "{err}");
            let released = with_timeout(connect_timeout, session.unbind(), || {
                Error::ConnectionError("unbind timed out".to_string())
            })
            .await;
            if let Err(unbind_err) = released {
                debug!("releasing failed directory connection: {unbind_err}");
            }
            return Err(err);
        }

        info!(
            uri = %config.uri,
            start_tls = config.use_tls,
            anonymous = config.is_anonymous(),
            "directory connection established"
        );
        Ok(session)
    }
}

async fn with_timeout<F, T>(
    limit: Duration,
    fut: F,
    on_elapsed: impl FnOnce() -> Error,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout(limit, fut).await.map_err(|_| on_elapsed())?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::RawEntry;
    use crate::session::{MockDirectoryConnector, MockDirectorySession};
    use async_trait::async_trait;
    use dirlookup_core::SearchScope;
    use std::future::pending;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type SearchLog = Arc<Mutex<Vec<(String, SearchScope, String)>>>;

    fn sample_config() -> DirectoryConfig {
        DirectoryConfig::new(
            "ldap://ldap.example.com",
            "dc=example,dc=com",
            "(uid=__USERNAME__)",
        )
        .unwrap()
        .with_bind("cn=reader,dc=example,dc=com", "secret")
    }

    fn alice() -> RawEntry {
        RawEntry::new("uid=alice,dc=example,dc=com")
            .with_attribute("uid", ["alice"])
            .with_attribute("cn", ["Alice Liddell"])
            .with_attribute("mail", ["alice@example.com"])
    }

    fn recording_session(log: &SearchLog, entries: Vec<RawEntry>) -> MockDirectorySession {
        let mut session = MockDirectorySession::new();
        session.expect_simple_bind().times(1).returning(|_, _| Ok(()));
        let log = Arc::clone(log);
        session
            .expect_search()
            .returning(move |base_dn, scope, filter| {
                log.lock()
                    .unwrap()
                    .push((base_dn.to_string(), scope, filter.to_string()));
                Ok(entries.clone())
            });
        session
    }

    fn connector_for(session: MockDirectorySession) -> MockDirectoryConnector {
        let mut connector = MockDirectoryConnector::new();
        connector
            .expect_connect()
            .times(1)
            .return_once(move || Ok(Box::new(session)));
        connector
    }

    #[tokio::test]
    async fn base_scope_searches_only_the_base_entry() {
        let log = SearchLog::default();
        let session = recording_session(&log, vec![alice()]);
        let config = sample_config().with_scope(SearchScope::Base);
        let mut lookup = DirectoryLookup::with_connector(config, Box::new(connector_for(session)));

        let result = lookup.search("alice").await.unwrap().unwrap();
        assert_eq!(result.first("cn"), Some("Alice Liddell"));

        let searches = log.lock().unwrap();
        assert_eq!(
            *searches,
            vec![(
                "dc=example,dc=com".to_string(),
                SearchScope::Base,
                "(uid=alice)".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn each_scope_is_dispatched_as_configured() {
        for scope in [SearchScope::Subtree, SearchScope::OneLevel, SearchScope::Base] {
            let log = SearchLog::default();
            let session = recording_session(&log, Vec::new());
            let config = sample_config().with_scope(scope);
            let mut lookup =
                DirectoryLookup::with_connector(config, Box::new(connector_for(session)));

            lookup.search("alice").await.unwrap();
            let searches = log.lock().unwrap();
            assert_eq!(searches.len(), 1);
            assert_eq!(searches[0].1, scope);
        }
    }

    #[tokio::test]
    async fn username_is_escaped_in_filter() {
        let log = SearchLog::default();
        let session = recording_session(&log, Vec::new());
        let mut lookup =
            DirectoryLookup::with_connector(sample_config(), Box::new(connector_for(session)));

        lookup.search("*").await.unwrap();
        assert_eq!(log.lock().unwrap()[0].2, "(uid=\\2a)");
    }

    #[tokio::test]
    async fn zero_entries_is_not_found() {
        let log = SearchLog::default();
        let session = recording_session(&log, Vec::new());
        let mut lookup =
            DirectoryLookup::with_connector(sample_config(), Box::new(connector_for(session)));

        assert_eq!(lookup.search("nobody").await.unwrap(), None);
        assert!(lookup.is_connected());
    }

    #[tokio::test]
    async fn only_first_entry_is_returned() {
        let bob = RawEntry::new("uid=bob,dc=example,dc=com")
            .with_attribute("uid", ["bob"])
            .with_attribute("mail", ["bob@example.com"]);
        let log = SearchLog::default();
        let session = recording_session(&log, vec![alice(), bob]);
        let mut lookup =
            DirectoryLookup::with_connector(sample_config(), Box::new(connector_for(session)));

        let result = lookup.search("*").await.unwrap().unwrap();
        assert_eq!(result.first("uid"), Some("alice"));
        assert_eq!(result.values("mail").unwrap(), ["alice@example.com"]);
    }

    #[tokio::test]
    async fn connection_is_reused_across_searches() {
        let log = SearchLog::default();
        let session = recording_session(&log, vec![alice()]);
        let mut lookup =
            DirectoryLookup::with_connector(sample_config(), Box::new(connector_for(session)));

        assert!(!lookup.is_connected());
        lookup.search("alice").await.unwrap();
        lookup.search("alice").await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn explicit_connect_is_idempotent() {
        let log = SearchLog::default();
        let session = recording_session(&log, vec![alice()]);
        let mut lookup =
            DirectoryLookup::with_connector(sample_config(), Box::new(connector_for(session)));

        lookup.connect().await.unwrap();
        lookup.connect().await.unwrap();
        assert!(lookup.is_connected());
        assert!(lookup.search("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn start_tls_failure_skips_bind_and_allows_retry() {
        let mut sequence = mockall::Sequence::new();
        let mut connector = MockDirectoryConnector::new();
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| {
                Err(Error::ConnectionError(
                    "StartTLS negotiation failed".to_string(),
                ))
            });

        let log = SearchLog::default();
        let session = recording_session(&log, vec![alice()]);
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut sequence)
            .return_once(move || Ok(Box::new(session)));

        let config = sample_config().with_start_tls(true);
        let mut lookup = DirectoryLookup::with_connector(config, Box::new(connector));

        let err = lookup.search("alice").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionError(_)));
        assert_eq!(err.error_code(), "LDAP_CONNECTION_ERROR");
        assert!(!lookup.is_connected());
        assert!(log.lock().unwrap().is_empty());

        assert!(lookup.search("alice").await.unwrap().is_some());
        assert!(lookup.is_connected());
    }

    #[tokio::test]
    async fn bind_failure_releases_connection() {
        let mut session = MockDirectorySession::new();
        session
            .expect_simple_bind()
            .times(1)
            .returning(|_, _| Err(Error::BindError("invalid credentials".to_string())));
        session.expect_unbind().times(1).returning(|| Ok(()));
        session.expect_search().never();

        let mut lookup =
            DirectoryLookup::with_connector(sample_config(), Box::new(connector_for(session)));

        let err = lookup.search("alice").await.unwrap_err();
        assert!(matches!(err, Error::BindError(_)));
        assert!(!lookup.is_connected());
    }

    #[tokio::test]
    async fn anonymous_bind_uses_empty_credentials() {
        let mut session = MockDirectorySession::new();
        session
            .expect_simple_bind()
            .withf(|dn, password| dn.is_empty() && password.is_empty())
            .times(1)
            .returning(|_, _| Ok(()));
        session.expect_search().returning(|_, _, _| Ok(Vec::new()));

        let config = DirectoryConfig::new(
            "ldap://ldap.example.com",
            "dc=example,dc=com",
            "(uid=__USERNAME__)",
        )
        .unwrap();
        let mut lookup = DirectoryLookup::with_connector(config, Box::new(connector_for(session)));
        assert_eq!(lookup.search("alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn search_failure_is_distinct_from_not_found() {
        let mut session = MockDirectorySession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session
            .expect_search()
            .returning(|_, _, _| Err(Error::SearchError("noSuchObject".to_string())));

        let mut lookup =
            DirectoryLookup::with_connector(sample_config(), Box::new(connector_for(session)));

        let err = lookup.search("alice").await.unwrap_err();
        assert!(matches!(err, Error::SearchError(_)));
        assert!(lookup.is_connected());
    }

    #[tokio::test]
    async fn empty_username_does_not_touch_the_network() {
        let mut connector = MockDirectoryConnector::new();
        connector.expect_connect().never();
        let mut lookup = DirectoryLookup::with_connector(sample_config(), Box::new(connector));

        assert_eq!(lookup.search("").await.unwrap(), None);
        assert!(!lookup.is_connected());
    }

    #[tokio::test]
    async fn close_unbinds_and_forgets_the_session() {
        let log = SearchLog::default();
        let mut session = recording_session(&log, vec![alice()]);
        session.expect_unbind().times(1).returning(|| Ok(()));
        let mut lookup =
            DirectoryLookup::with_connector(sample_config(), Box::new(connector_for(session)));

        lookup.connect().await.unwrap();
        lookup.close().await.unwrap();
        assert!(!lookup.is_connected());
        lookup.close().await.unwrap();
    }

    /// Session whose bind or search never answers.
    struct StalledSession {
        stall_bind: bool,
        unbinds: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DirectorySession for StalledSession {
        async fn simple_bind(&mut self, _dn: &str, _password: &str) -> Result<()> {
            if self.stall_bind {
                pending::<()>().await;
            }
            Ok(())
        }

        async fn search(
            &mut self,
            _base_dn: &str,
            _scope: SearchScope,
            _filter: &str,
        ) -> Result<Vec<RawEntry>> {
            pending().await
        }

        async fn unbind(&mut self) -> Result<()> {
            self.unbinds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StalledConnector {
        stall_connect: bool,
        stall_bind: bool,
        connects: Arc<AtomicUsize>,
        unbinds: Arc<AtomicUsize>,
    }

    impl StalledConnector {
        fn new(stall_connect: bool, stall_bind: bool) -> Self {
            Self {
                stall_connect,
                stall_bind,
                connects: Arc::default(),
                unbinds: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl DirectoryConnector for StalledConnector {
        async fn connect(&self) -> Result<Box<dyn DirectorySession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.stall_connect {
                pending::<()>().await;
            }
            Ok(Box::new(StalledSession {
                stall_bind: self.stall_bind,
                unbinds: Arc::clone(&self.unbinds),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_search_times_out_and_keeps_session() {
        let connector = StalledConnector::new(false, false);
        let connects = Arc::clone(&connector.connects);
        let config = sample_config().with_operation_timeout_secs(2);
        let mut lookup = DirectoryLookup::with_connector(config, Box::new(connector));

        let err = lookup.search("alice").await.unwrap_err();
        assert!(matches!(err, Error::SearchError(_)));
        assert!(err.to_string().contains("timed out"));
        assert!(lookup.is_connected());

        lookup.search("alice").await.unwrap_err();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connect_times_out() {
        let connector = StalledConnector::new(true, false);
        let unbinds = Arc::clone(&connector.unbinds);
        let config = sample_config().with_connect_timeout_secs(3);
        let mut lookup = DirectoryLookup::with_connector(config, Box::new(connector));

        let err = lookup.search("alice").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionError(_)));
        assert!(err.to_string().contains("timed out"));
        assert!(!lookup.is_connected());
        assert_eq!(unbinds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_bind_times_out_and_releases_connection() {
        let connector = StalledConnector::new(false, true);
        let unbinds = Arc::clone(&connector.unbinds);
        let connects = Arc::clone(&connector.connects);
        let mut lookup = DirectoryLookup::with_connector(sample_config(), Box::new(connector));

        let err = lookup.connect().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionError(_)));
        assert!(err.to_string().contains("bind"));
        assert!(!lookup.is_connected());
        assert_eq!(unbinds.load(Ordering::SeqCst), 1);

        lookup.connect().await.unwrap_err();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lost_connection_during_search_reconnects_next_time() {
        let mut sequence = mockall::Sequence::new();
        let mut connector = MockDirectoryConnector::new();

        let mut broken = MockDirectorySession::new();
        broken.expect_simple_bind().returning(|_, _| Ok(()));
        broken.expect_search().times(1).returning(|_, _, _| {
            Err(Error::ConnectionError(
                "premature end of search stream".to_string(),
            ))
        });
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut sequence)
            .return_once(move || Ok(Box::new(broken)));

        let log = SearchLog::default();
        let healthy = recording_session(&log, vec![alice()]);
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut sequence)
            .return_once(move || Ok(Box::new(healthy)));

        let mut lookup = DirectoryLookup::with_connector(sample_config(), Box::new(connector));

        let err = lookup.search("alice").await.unwrap_err();
        assert!(matches!(err, Error::SearchError(_)));
        assert!(!lookup.is_connected());

        assert!(lookup.search("alice").await.unwrap().is_some());
        assert!(lookup.is_connected());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = DirectoryConfig::new(
            "ldaps://ldap.example.com",
            "dc=example,dc=com",
            "(uid=__USERNAME__)",
        )
        .unwrap()
        .with_start_tls(true);
        assert!(matches!(
            DirectoryLookup::new(Arc::new(config)),
            Err(Error::ConfigError(_))
        ));
    }
}
