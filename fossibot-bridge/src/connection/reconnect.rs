//! Tiered reconnect controller.
//!
//! Tier 1 handles transport failures: exponential backoff, fresh
//! WebSocket, MQTT handshake, resubscribe. Tier 2 handles credential
//! failures (CONNACK 4/5, or three consecutive tier-1 failures): the
//! cached tokens are purged progressively deeper on each escalation
//! (MQTT token, then the login token as well, then everything) and the
//! cache-first auth engine refetches exactly the purged stages. Five
//! consecutive handshake failures park the account in a fatal state that
//! is retried every five minutes without disturbing other accounts.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cloud::AuthEngine;
use crate::persistence::TokenStage;

use super::eventloop::{Session, SessionEnd, SessionError};
use super::{ClientCommand, ClientEvent, ConnectionState};

/// Floor between connection attempts, whatever the backoff says.
const MIN_ATTEMPT_SPACING: Duration = Duration::from_secs(5);

/// Pause before retrying an account that is in the fatal state.
const FATAL_RETRY: Duration = Duration::from_secs(300);

/// Consecutive tier-1 failures that escalate to tier 2.
const TIER1_ESCALATION_THRESHOLD: u32 = 3;

/// Consecutive full-handshake failures that park the account.
const HANDSHAKE_FATAL_THRESHOLD: u32 = 5;

pub(crate) struct Supervisor {
    pub(crate) account: String,
    pub(crate) auth: AuthEngine,
    pub(crate) subscriptions: BTreeSet<String>,
    pub(crate) commands: mpsc::UnboundedReceiver<ClientCommand>,
    pub(crate) events: mpsc::UnboundedSender<(String, ClientEvent)>,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) delay_min: Duration,
    pub(crate) delay_max: Duration,
    pub(crate) ca_file: Option<PathBuf>,
}

impl Supervisor {
    pub(crate) async fn run(mut self) {
        let mut backoff = Backoff::new(self.delay_min, self.delay_max);
        let mut transport_failures: u32 = 0;
        let mut handshake_failures: u32 = 0;
        let mut tier2_step: u32 = 0;
        let mut last_attempt: Option<Instant> = None;

        loop {
            if self.cancellation.is_cancelled() {
                break;
            }
            self.drain_commands_while_offline();

            // Defensive floor against tight crash loops.
            if let Some(at) = last_attempt {
                let since = at.elapsed();
                if since < MIN_ATTEMPT_SPACING && !self.sleep(MIN_ATTEMPT_SPACING - since).await {
                    break;
                }
            }
            last_attempt = Some(Instant::now());

            self.set_state(ConnectionState::Authenticating);
            let tokens = tokio::select! {
                _ = self.cancellation.cancelled() => break,
                result = self.auth.acquire() => result,
            };
            let tokens = match tokens {
                Ok(tokens) => tokens,
                Err(e) => {
                    handshake_failures += 1;
                    log::warn!(
                        "[{}] Handshake failed ({handshake_failures} in a row): {e}",
                        self.account
                    );
                    if handshake_failures >= HANDSHAKE_FATAL_THRESHOLD {
                        log::error!(
                            "[{}] Giving up on the account for now; retrying in {}s",
                            self.account,
                            FATAL_RETRY.as_secs()
                        );
                        self.set_state(ConnectionState::Fatal);
                        if !self.sleep(FATAL_RETRY).await {
                            break;
                        }
                    } else if !self.schedule_reconnect(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            };
            handshake_failures = 0;

            self.set_state(ConnectionState::WsConnecting);
            let session = tokio::select! {
                _ = self.cancellation.cancelled() => break,
                result = Session::open(&self.account, self.ca_file.as_deref()) => result,
            };
            let mut session = match session {
                Ok(session) => session,
                Err(e) => {
                    transport_failures += 1;
                    log::warn!(
                        "[{}] Connection attempt failed ({transport_failures} in a row): {e}",
                        self.account
                    );
                    if transport_failures >= TIER1_ESCALATION_THRESHOLD {
                        self.escalate_tier2(&mut tier2_step);
                        transport_failures = 0;
                    }
                    if !self.schedule_reconnect(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConnectionState::MqttHandshake);
            let handshake = tokio::select! {
                _ = self.cancellation.cancelled() => break,
                result = session.handshake(&tokens.mqtt) => result,
            };
            match handshake {
                Ok(()) => {}
                Err(SessionError::CredentialsRejected(code)) => {
                    log::warn!(
                        "[{}] CONNACK {code:?}: the MQTT credential is no longer valid",
                        self.account
                    );
                    self.escalate_tier2(&mut tier2_step);
                    transport_failures = 0;
                    if !self.schedule_reconnect(&mut backoff).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    transport_failures += 1;
                    log::warn!(
                        "[{}] MQTT handshake failed ({transport_failures} in a row): {e}",
                        self.account
                    );
                    if transport_failures >= TIER1_ESCALATION_THRESHOLD {
                        self.escalate_tier2(&mut tier2_step);
                        transport_failures = 0;
                    }
                    if !self.schedule_reconnect(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            }

            self.set_state(ConnectionState::Subscribing);
            let topics: Vec<String> = self.subscriptions.iter().cloned().collect();
            log::debug!(
                "[{}] Subscribing to {} device topics",
                self.account,
                topics.len()
            );
            if let Err(e) = session.subscribe(&topics).await {
                transport_failures += 1;
                log::warn!("[{}] Subscribing failed: {e}", self.account);
                if !self.schedule_reconnect(&mut backoff).await {
                    break;
                }
                continue;
            }

            self.set_state(ConnectionState::Connected);
            let _ = self
                .events
                .send((self.account.clone(), ClientEvent::Connected));
            backoff.reset();
            transport_failures = 0;
            tier2_step = 0;

            let end = session
                .run(
                    &mut self.commands,
                    &self.events,
                    &mut self.subscriptions,
                    &self.cancellation,
                )
                .await;
            let _ = self
                .events
                .send((self.account.clone(), ClientEvent::Disconnected));

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Transport(reason) => {
                    log::warn!("[{}] Session lost: {reason}", self.account);
                }
                SessionEnd::KeepAliveTimeout => {
                    log::warn!("[{}] Session lost: keep-alive timeout", self.account);
                }
                SessionEnd::Protocol(e) => {
                    log::warn!("[{}] Session lost: {e}", self.account);
                }
            }
            transport_failures += 1;
            if transport_failures >= TIER1_ESCALATION_THRESHOLD {
                self.escalate_tier2(&mut tier2_step);
                transport_failures = 0;
            }
            if !self.schedule_reconnect(&mut backoff).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        log::debug!("[{}] Cloud client stopped", self.account);
    }

    /// Walks the handshake chain backwards: MQTT token first, then the
    /// login token, then everything.
    fn escalate_tier2(&self, step: &mut u32) {
        match *step {
            0 => {
                log::info!("[{}] Purging the MQTT token", self.account);
                self.auth.purge(TokenStage::Mqtt);
            }
            1 => {
                log::info!("[{}] Purging the MQTT and login tokens", self.account);
                self.auth.purge(TokenStage::Mqtt);
                self.auth.purge(TokenStage::Login);
            }
            _ => {
                log::info!("[{}] Purging all cached tokens", self.account);
                self.auth.purge_all();
            }
        }
        *step += 1;
    }

    /// Publishes and stray subscriptions arriving while offline must not
    /// pile up in the channel; state publishes are snapshot-based and
    /// will be regenerated after reconnecting.
    fn drain_commands_while_offline(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ClientCommand::Publish { topic, .. } => {
                    log::debug!(
                        "[{}] Dropping publish to {topic} while disconnected",
                        self.account
                    );
                }
                ClientCommand::Subscribe { topic } => {
                    self.subscriptions.insert(topic);
                }
                ClientCommand::Shutdown => {
                    self.cancellation.cancel();
                }
            }
        }
    }

    async fn schedule_reconnect(&mut self, backoff: &mut Backoff) -> bool {
        let delay = backoff.next_delay();
        self.set_state(ConnectionState::ReconnectScheduled);
        let _ = self.events.send((
            self.account.clone(),
            ClientEvent::ReconnectScheduled { delay },
        ));
        log::info!(
            "[{}] Reconnecting in {}s",
            self.account,
            delay.as_secs()
        );
        self.sleep(delay).await
    }

    /// Cancellable sleep; returns false when cancelled.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancellation.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

/// Exponential backoff doubling from `min` to `max`.
#[derive(Debug)]
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        Backoff {
            min,
            max,
            current: min,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.min;
    }
}
