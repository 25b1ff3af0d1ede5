//! IMAP connector (LOGIN over implicit TLS) using async-imap 0.11 with tokio-rustls.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_imap::error::Error as ImapError;
use async_imap::extensions::idle::IdleResponse;
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt, TryStreamExt};
use rustls_native_certs::load_native_certs;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use super::{uid_sequence, Connector, MailTransport};
use crate::errors::{SyncError, SyncResult};
use crate::types::{FetchScope, MailboxEvent, RawMessage};

type ImapSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

const FETCH_QUERY: &str = "(UID BODY.PEEK[])";

pub struct ImapConnector {
    host: String,
    port: u16,
    user: String,
    password: String,
}

impl ImapConnector {
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    async fn open_session(&self) -> SyncResult<ImapSession> {
        let mut root_store = RootCertStore::empty();
        let certs = load_native_certs()
            .map_err(|e| SyncError::Connection(format!("failed to load native certs: {e}")))?;
        for cert in certs {
            if let Err(e) = root_store.add(&tokio_rustls::rustls::Certificate(cert.0)) {
                debug!(error = %e, "Skipping unusable native certificate");
            }
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                SyncError::Connection(format!("connecting to {}:{}: {e}", self.host, self.port))
            })?;

        let server_name = ServerName::try_from(self.host.as_str())
            .map_err(|e| SyncError::Connection(format!("invalid DNS name {}: {e}", self.host)))?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| SyncError::Connection(format!("starting TLS for IMAP: {e}")))?;

        // async-imap speaks futures-io
        let mut client = Client::new(tls_stream.compat());

        let _greeting = client
            .read_response()
            .await
            .map_err(|e| SyncError::Connection(format!("reading IMAP greeting: {e}")))?
            .ok_or_else(|| {
                SyncError::Connection("unexpected end of stream, expected greeting".into())
            })?;

        client
            .login(&self.user, &self.password)
            .await
            .map_err(|(err, _client)| SyncError::Connection(format!("LOGIN failed: {err}")))
    }
}

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(&self) -> SyncResult<Box<dyn MailTransport>> {
        let mut session = self.open_session().await?;
        let idle = match session.capabilities().await {
            Ok(caps) => caps.has_str("IDLE"),
            Err(e) => {
                warn!(error = %e, "CAPABILITY failed; assuming no IDLE support");
                false
            }
        };
        info!(host = %self.host, user = %self.user, idle, "IMAP session established");
        Ok(Box::new(ImapTransport::new(session, idle)))
    }
}

/// Live IMAP session. Any I/O failure marks the transport dead so the
/// supervisor can replace it.
pub struct ImapTransport {
    session: Option<ImapSession>,
    alive: Arc<AtomicBool>,
    supports_idle: bool,
}

impl ImapTransport {
    fn new(session: ImapSession, supports_idle: bool) -> Self {
        Self {
            session: Some(session),
            alive: Arc::new(AtomicBool::new(true)),
            supports_idle,
        }
    }

    fn session(&mut self) -> SyncResult<&mut ImapSession> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SyncError::Connection("session is closed".into()));
        }
        self.session
            .as_mut()
            .ok_or_else(|| SyncError::Connection("session is closed".into()))
    }

    fn fail(&mut self, err: ImapError, wrap: fn(String) -> SyncError) -> SyncError {
        let mapped = map_error(&self.alive, err, wrap);
        if mapped.is_connection() {
            self.session = None;
        }
        mapped
    }
}

/// Responses without a UID are unsolicited updates and are skipped. A
/// response without a body fails the item so the message stays unseen.
fn raw_message(uid: Option<u32>, body: Option<&[u8]>) -> Option<SyncResult<RawMessage>> {
    let Some(uid) = uid else {
        debug!("Skipping FETCH response without UID");
        return None;
    };
    Some(match body {
        Some(body) => Ok(RawMessage {
            uid,
            body: body.to_vec(),
        }),
        None => Err(SyncError::Fetch(format!("uid {uid}: FETCH response without BODY[]"))),
    })
}

fn map_error(alive: &AtomicBool, err: ImapError, wrap: fn(String) -> SyncError) -> SyncError {
    match err {
        ImapError::Io(_) | ImapError::ConnectionLost => {
            alive.store(false, Ordering::SeqCst);
            SyncError::Connection(err.to_string())
        }
        other => wrap(other.to_string()),
    }
}

#[async_trait]
impl MailTransport for ImapTransport {
    async fn select(&mut self, folder: &str) -> SyncResult<()> {
        let result = self.session()?.select(folder).await;
        let mailbox = result.map_err(|e| self.fail(e, SyncError::Protocol))?;
        debug!(folder, exists = mailbox.exists, "Folder selected");
        Ok(())
    }

    async fn search(&mut self, scope: &FetchScope) -> SyncResult<Vec<u32>> {
        let query = scope.to_imap_query();
        let result = self.session()?.uid_search(&query).await;
        let uids = result.map_err(|e| self.fail(e, SyncError::Search))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch<'a>(
        &'a mut self,
        uids: &[u32],
    ) -> SyncResult<BoxStream<'a, SyncResult<RawMessage>>> {
        let sequence = uid_sequence(uids);
        let alive = Arc::clone(&self.alive);
        let result = self.session()?.uid_fetch(&sequence, FETCH_QUERY).await;
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => return Err(map_error(&alive, e, SyncError::Fetch)),
        };

        Ok(stream
            .filter_map(move |item| {
                future::ready(match item {
                    Ok(fetch) => raw_message(fetch.uid, fetch.body()),
                    Err(e) => Some(Err(map_error(&alive, e, SyncError::Fetch))),
                })
            })
            .boxed())
    }

    async fn mark_seen(&mut self, uid: u32) -> SyncResult<()> {
        let alive = Arc::clone(&self.alive);
        let session = self.session()?;
        let result = match session.uid_store(uid.to_string(), "+FLAGS (\\Seen)").await {
            Ok(stream) => stream.try_collect::<Vec<_>>().await.map(|_| ()),
            Err(e) => Err(e),
        };
        result.map_err(|e| map_error(&alive, e, SyncError::FlagUpdate))
    }

    async fn status(&mut self, folder: &str) -> SyncResult<()> {
        let result = self.session()?.status(folder, "(MESSAGES UNSEEN)").await;
        let mailbox = result.map_err(|e| self.fail(e, SyncError::Protocol))?;
        debug!(folder, exists = mailbox.exists, unseen = ?mailbox.unseen, "STATUS ok");
        Ok(())
    }

    async fn wait_for_mail(&mut self, timeout: Duration) -> SyncResult<MailboxEvent> {
        if !self.supports_idle {
            tokio::time::sleep(timeout).await;
            let result = self.session()?.noop().await;
            result.map_err(|e| self.fail(e, SyncError::Protocol))?;
            return Ok(MailboxEvent::Timeout);
        }

        self.session()?;
        let Some(session) = self.session.take() else {
            return Err(SyncError::Connection("session is closed".into()));
        };

        let mut idle = session.idle();
        if let Err(e) = idle.init().await {
            self.alive.store(false, Ordering::SeqCst);
            return Err(SyncError::Connection(format!("IDLE init failed: {e}")));
        }

        let response = {
            let (wait, _stop) = idle.wait_with_timeout(timeout);
            wait.await
        };

        match idle.done().await {
            Ok(session) => self.session = Some(session),
            Err(e) => {
                self.alive.store(false, Ordering::SeqCst);
                return Err(SyncError::Connection(format!("ending IDLE failed: {e}")));
            }
        }

        match response {
            Ok(IdleResponse::NewData(_)) => Ok(MailboxEvent::NewMail),
            Ok(IdleResponse::Timeout) | Ok(IdleResponse::ManualInterrupt) => {
                Ok(MailboxEvent::Timeout)
            }
            Err(e) => Err(map_error(&self.alive, e, SyncError::Protocol)),
        }
    }

    fn is_connected(&self) -> bool {
        self.session.is_some() && self.alive.load(Ordering::SeqCst)
    }

    async fn logout(&mut self) -> SyncResult<()> {
        if let Some(mut session) = self.session.take() {
            self.alive.store(false, Ordering::SeqCst);
            session
                .logout()
                .await
                .map_err(|e| SyncError::Connection(format!("LOGOUT failed: {e}")))?;
        }
        Ok(())
    }
}
