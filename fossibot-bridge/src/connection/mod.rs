//! Cloud client: one persistent MQTT-over-WebSocket session per account.
//!
//! [`CloudClient`] is a cheap handle; the actual connection lives in a
//! spawned supervisor task that authenticates, connects, resubscribes
//! and backs off on its own. The bridge talks to it through commands and
//! receives decoded publishes as [`ClientEvent`]s tagged with the
//! account, so one channel can fan in every account.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::cloud::AuthEngine;
use crate::mqtt::QoS;

mod eventloop;
mod reconnect;

use reconnect::Supervisor;

/// Connection lifecycle of one account's cloud session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Authenticating,
    WsConnecting,
    MqttHandshake,
    Subscribing,
    Connected,
    ReconnectScheduled,
    /// Five consecutive handshake failures; retried every five minutes.
    Fatal,
}

/// Events emitted by a cloud client, tagged with its account email.
#[derive(Debug)]
pub enum ClientEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Disconnected,
    ReconnectScheduled { delay: Duration },
}

#[derive(Debug)]
pub(crate) enum ClientCommand {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
    Subscribe {
        topic: String,
    },
    Shutdown,
}

pub struct CloudClientOptions {
    /// Account email; used to tag events and logs.
    pub account: String,
    /// Topics subscribed on every (re)connect.
    pub subscriptions: Vec<String>,
    pub reconnect_delay_min: Duration,
    pub reconnect_delay_max: Duration,
    /// Extra root certificate for the cloud's TLS endpoint.
    pub ca_file: Option<PathBuf>,
}

pub struct CloudClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
    state: watch::Receiver<ConnectionState>,
    cancellation: CancellationToken,
}

impl CloudClient {
    /// Spawns the supervisor task and returns the handle. The task runs
    /// until [`shutdown`](Self::shutdown) or the cancellation token
    /// fires.
    pub fn spawn(
        options: CloudClientOptions,
        auth: AuthEngine,
        events: mpsc::UnboundedSender<(String, ClientEvent)>,
        cancellation: CancellationToken,
    ) -> CloudClient {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let supervisor = Supervisor {
            account: options.account,
            auth,
            subscriptions: BTreeSet::from_iter(options.subscriptions),
            commands: command_rx,
            events,
            state: state_tx,
            cancellation: cancellation.clone(),
            delay_min: options.reconnect_delay_min,
            delay_max: options.reconnect_delay_max,
            ca_file: options.ca_file,
        };
        tokio::spawn(supervisor.run());

        CloudClient {
            commands: command_tx,
            state: state_rx,
            cancellation,
        }
    }

    /// Queues a publish; dropped with a log line when the session is
    /// down (snapshot publishing makes retries pointless).
    pub fn publish(&self, topic: String, payload: Vec<u8>, qos: QoS) {
        let _ = self.commands.send(ClientCommand::Publish {
            topic,
            payload,
            qos,
        });
    }

    /// Adds a topic to the subscription set and subscribes immediately
    /// when connected; re-established on every reconnect either way.
    pub fn subscribe(&self, topic: String) {
        let _ = self.commands.send(ClientCommand::Subscribe { topic });
    }

    /// Sends MQTT DISCONNECT, closes the WebSocket and stops the task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ClientCommand::Shutdown);
        self.cancellation.cancel();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}
