//! Connection lifecycle: connect, open the folder, keep the session alive,
//! dispatch mailbox events into the sync engine, reconnect after a drop.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::errors::SyncResult;
use crate::imap::{Connector, MailTransport};
use crate::sync::{SyncEngine, SyncOutcome, SyncTrigger};
use crate::types::{ConnectionState, MailboxEvent};

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    /// Interval between keep-alive checks; keep it under the server's idle timeout.
    pub keepalive_interval: Duration,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,
}

pub struct Supervisor {
    connector: Arc<dyn Connector>,
    engine: Arc<SyncEngine>,
    settings: SupervisorSettings,
    state: watch::Sender<ConnectionState>,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        engine: Arc<SyncEngine>,
        settings: SupervisorSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            engine,
            settings,
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Run until the process stops. Only a failure of the very first connect
    /// is returned; once a session has been up, drops are retried forever
    /// after the fixed delay.
    pub async fn run(&self) -> SyncResult<()> {
        let mut transport = self.connect().await?;

        loop {
            self.run_session(transport.as_mut()).await;
            if let Err(e) = transport.logout().await {
                debug!(error = %e, "Logout after session end failed");
            }
            self.set_state(ConnectionState::Disconnected);

            transport = loop {
                warn!(
                    delay_secs = self.settings.reconnect_delay.as_secs(),
                    "Connection lost; reconnecting after fixed delay"
                );
                sleep(self.settings.reconnect_delay).await;
                match self.connect().await {
                    Ok(transport) => break transport,
                    Err(e) => error!(error = %e, "Reconnect attempt failed"),
                }
            };
        }
    }

    /// Connect, run a single sync as if the mailbox had just been opened,
    /// and log out.
    pub async fn run_once(&self) -> SyncResult<SyncOutcome> {
        let mut transport = self.connect().await?;
        let folder = self.engine.folder().to_string();

        let outcome = match transport.select(&folder).await {
            Ok(()) => {
                self.engine
                    .trigger(SyncTrigger::MailboxOpened, transport.as_mut())
                    .await
            }
            Err(e) => {
                let _ = transport.logout().await;
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if let Err(e) = transport.logout().await {
            debug!(error = %e, "Logout failed");
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(outcome)
    }

    async fn connect(&self) -> SyncResult<Box<dyn MailTransport>> {
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to mail server");
        match self.connector.connect().await {
            Ok(transport) => {
                self.set_state(ConnectionState::Ready);
                info!("Mail connection ready");
                Ok(transport)
            }
            Err(e) => {
                error!(error = %e, "Mail connection failed");
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Drive one live session until it can no longer be used.
    async fn run_session(&self, transport: &mut dyn MailTransport) {
        let folder = self.engine.folder().to_string();

        if let Err(e) = transport.select(&folder).await {
            error!(folder = %folder, error = %e, "Opening mailbox failed");
            if !e.is_connection() && transport.is_connected() {
                self.set_state(ConnectionState::Degraded);
            }
            return;
        }
        info!(folder = %folder, "Mailbox opened");
        log_outcome(
            SyncTrigger::MailboxOpened,
            &self.engine.trigger(SyncTrigger::MailboxOpened, transport).await,
        );

        let interval = self.settings.keepalive_interval;
        let mut next_keepalive = Instant::now() + interval;

        while transport.is_connected() {
            let wait = next_keepalive.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                match transport.wait_for_mail(wait).await {
                    Ok(MailboxEvent::NewMail) => {
                        info!(folder = %folder, "New mail event received");
                        let outcome = self.engine.trigger(SyncTrigger::NewMail, transport).await;
                        log_outcome(SyncTrigger::NewMail, &outcome);
                    }
                    Ok(MailboxEvent::Timeout) => {}
                    Ok(MailboxEvent::Closed) => {
                        info!(folder = %folder, "Server ended the session");
                        return;
                    }
                    Err(e) => {
                        warn!(folder = %folder, error = %e, "Waiting for mail failed");
                        return;
                    }
                }
            }

            if transport.is_connected() && Instant::now() >= next_keepalive {
                self.watchdog(transport, &folder).await;
                next_keepalive = Instant::now() + interval;
            }
        }
    }

    /// Keep-alive check followed by a sync run.
    async fn watchdog(&self, transport: &mut dyn MailTransport, folder: &str) {
        debug!(folder, "Watchdog: STATUS keep-alive");
        match transport.status(folder).await {
            Ok(()) => {
                if self.state() == ConnectionState::Degraded {
                    info!(folder, "Keep-alive recovered");
                }
                self.set_state(ConnectionState::Ready);
            }
            Err(e) => {
                warn!(folder, error = %e, "Watchdog STATUS failed");
                if e.is_connection() || !transport.is_connected() {
                    return;
                }
                self.set_state(ConnectionState::Degraded);
            }
        }

        let outcome = self.engine.trigger(SyncTrigger::Watchdog, transport).await;
        log_outcome(SyncTrigger::Watchdog, &outcome);
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?current, to = ?next, "Connection state changed");
            *current = next;
            true
        });
    }
}

fn log_outcome(trigger: SyncTrigger, outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Skipped(reason) => debug!(?trigger, ?reason, "Sync skipped"),
        SyncOutcome::Ran(report) if report.error.is_some() => {
            warn!(?trigger, error = ?report.error, "Sync run ended with an error")
        }
        SyncOutcome::Ran(report) => {
            debug!(?trigger, ingested = report.ingested, "Sync run done")
        }
    }
}
