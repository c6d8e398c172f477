//! The orchestrator.
//!
//! One task owns every piece of mutable state: the per-device snapshots,
//! the device/account registries and the pacing queues. Cloud clients
//! and the broker client run as their own tasks and talk to it through
//! channels, so all StateStore mutation happens on this single loop and
//! no locks are needed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cloud::{
    self, api::ApiClient, devices as discovery, AuthEngine, Device, ResponseTopic,
};
use crate::config::Config;
use crate::connection::{ClientEvent, CloudClient, CloudClientOptions};
use crate::modbus;
use crate::mqtt::QoS;
use crate::persistence::{DeviceCache, FileStore, KeyValueStore, TokenCache};
use crate::state::{StateStore, UpdateSource};

pub mod broker;
pub mod command;
pub mod status;

use broker::{BrokerClient, BrokerEvent};
use command::{Command, CommandKind};
use status::{AccountStatus, DeviceStatus};

/// Window after a command during which polls are skipped so they cannot
/// collide with the in-flight response.
const POST_COMMAND_POLL_SUPPRESSION: Duration = Duration::from_secs(2);

/// Minimum spacing between settings writes to one device; faster writes
/// are silently dropped by the device.
const SETTINGS_SPACING: Duration = Duration::from_secs(2);

/// Settings produce no `/04` response; fresh values only show up in
/// poll data, so one is requested shortly after each settings write.
const SETTINGS_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// Granularity of the pacing queue drain.
const PACING_TICK: Duration = Duration::from_millis(500);

struct AccountEntry {
    client: CloudClient,
    /// Kept for periodic device re-discovery; the client's supervisor
    /// owns its own engine.
    auth: AuthEngine,
    connected: bool,
}

struct DeviceEntry {
    device: Device,
    account: String,
    last_seen: Option<DateTime<Utc>>,
    availability_online: bool,
    last_command_at: Option<Instant>,
    next_settings_at: Instant,
    pending_settings: VecDeque<(Vec<u8>, Instant)>,
    pending_refresh_at: Option<Instant>,
}

impl DeviceEntry {
    fn new(device: Device, account: String) -> Self {
        DeviceEntry {
            device,
            account,
            last_seen: None,
            availability_online: false,
            last_command_at: None,
            next_settings_at: Instant::now(),
            pending_settings: VecDeque::new(),
            pending_refresh_at: None,
        }
    }
}

enum SetupMsg {
    Initial {
        email: String,
        devices: Vec<Device>,
        auth: AuthEngine,
    },
    Refresh {
        email: String,
        devices: Vec<Device>,
    },
}

pub struct Bridge {
    config: Config,
    api: ApiClient,
    token_cache: TokenCache,
    device_cache: DeviceCache,
    state: StateStore,
}

impl Bridge {
    /// Builds the bridge with the file-backed caches from the config.
    pub fn new(config: Config) -> Result<Bridge> {
        let store: Arc<dyn KeyValueStore> = Arc::new(
            FileStore::open(&config.cache.directory).context("unable to open the cache directory")?,
        );
        Ok(Self::with_store(config, store))
    }

    /// Same bridge over any key/value store; tests run it in memory.
    pub fn with_store(config: Config, store: Arc<dyn KeyValueStore>) -> Bridge {
        let token_cache = TokenCache::new(
            store.clone(),
            config.cache.token_ttl_safety_margin,
            config.cache.max_token_ttl,
        );
        let device_cache = DeviceCache::new(store, config.cache.device_list_ttl);
        let state = StateStore::new(config.bridge.output_freshness_window);
        let api = ApiClient::new().expect("the HTTP client builder accepts static options");
        Bridge {
            config,
            api,
            token_cache,
            device_cache,
            state,
        }
    }

    /// Runs until the token is cancelled, then performs the graceful
    /// shutdown sequence (offline status, offline availability, cloud
    /// DISCONNECTs, broker disconnect).
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let started_at = Instant::now();
        let delay_min = Duration::from_secs(self.config.bridge.reconnect_delay_min);
        let delay_max = Duration::from_secs(self.config.bridge.reconnect_delay_max);

        let (cloud_events_tx, mut cloud_events): (
            mpsc::UnboundedSender<(String, ClientEvent)>,
            mpsc::UnboundedReceiver<(String, ClientEvent)>,
        ) = mpsc::unbounded_channel();
        let (broker_events_tx, mut broker_events) = mpsc::unbounded_channel();
        let (setup_tx, mut setup_results) = mpsc::unbounded_channel();

        let broker_cancel = CancellationToken::new();
        let broker = BrokerClient::spawn(
            &self.config.mosquitto,
            delay_min,
            delay_max,
            broker_events_tx,
            broker_cancel.clone(),
        );

        // Account bring-up runs concurrently; a failing account retries
        // on its own and never blocks the others.
        for account in self.config.enabled_accounts() {
            let auth = AuthEngine::new(
                self.api.clone(),
                self.token_cache.clone(),
                account.email.clone(),
                account.password.clone(),
            );
            spawn_discovery(
                self.api.clone(),
                self.device_cache.clone(),
                auth,
                setup_tx.clone(),
                shutdown.clone(),
                false,
            );
        }

        let mut accounts: HashMap<String, AccountEntry> = HashMap::new();
        let mut devices: HashMap<String, DeviceEntry> = HashMap::new();

        let mut poll_tick = interval(Duration::from_secs(self.config.bridge.device_poll_interval));
        let mut status_tick =
            interval(Duration::from_secs(self.config.bridge.status_publish_interval));
        let mut refresh_tick =
            interval(Duration::from_secs(self.config.cache.device_refresh_interval));
        let mut pacing_tick = interval(PACING_TICK);
        for tick in [&mut poll_tick, &mut status_tick, &mut refresh_tick, &mut pacing_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // The first immediate ticks are pointless before any device exists.
        poll_tick.reset();
        refresh_tick.reset();

        log::info!("Bridge is running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some((email, event)) = cloud_events.recv() => {
                    self.handle_cloud_event(&email, event, &mut accounts, &mut devices, &broker).await;
                }
                Some(event) = broker_events.recv() => {
                    self.handle_broker_event(event, &accounts, &mut devices, &broker).await;
                }
                Some(message) = setup_results.recv() => {
                    self.handle_setup(
                        message,
                        &mut accounts,
                        &mut devices,
                        &cloud_events_tx,
                        delay_min,
                        delay_max,
                    );
                }
                _ = poll_tick.tick() => {
                    self.poll_devices(&accounts, &devices);
                }
                _ = status_tick.tick() => {
                    self.publish_status(&accounts, &devices, &broker, started_at, "online").await;
                }
                _ = refresh_tick.tick() => {
                    log::info!("Refreshing device inventories");
                    for (email, entry) in &accounts {
                        self.device_cache.invalidate(email);
                        spawn_discovery(
                            self.api.clone(),
                            self.device_cache.clone(),
                            entry.auth.clone(),
                            setup_tx.clone(),
                            shutdown.clone(),
                            true,
                        );
                    }
                }
                _ = pacing_tick.tick() => {
                    self.drain_pacing_queues(&accounts, &mut devices);
                }
            }
        }

        log::info!("Shutting down");
        self.publish_status(&accounts, &devices, &broker, started_at, "offline")
            .await;
        for (mac, entry) in &mut devices {
            entry.availability_online = false;
            broker
                .publish(broker::availability_topic(mac), b"offline".to_vec(), true)
                .await;
        }
        for entry in accounts.values() {
            entry.client.shutdown();
        }
        broker.disconnect().await;
        broker_cancel.cancel();
        Ok(())
    }

    async fn handle_cloud_event(
        &mut self,
        email: &str,
        event: ClientEvent,
        accounts: &mut HashMap<String, AccountEntry>,
        devices: &mut HashMap<String, DeviceEntry>,
        broker: &BrokerClient,
    ) {
        match event {
            ClientEvent::Connected => {
                if let Some(entry) = accounts.get_mut(email) {
                    entry.connected = true;
                }
                for (mac, entry) in devices.iter_mut().filter(|(_, d)| d.account == email) {
                    if !entry.availability_online {
                        entry.availability_online = true;
                        broker
                            .publish(broker::availability_topic(mac), b"online".to_vec(), true)
                            .await;
                    }
                }
            }
            ClientEvent::Disconnected => {
                if let Some(entry) = accounts.get_mut(email) {
                    entry.connected = false;
                }
                for (mac, entry) in devices.iter_mut().filter(|(_, d)| d.account == email) {
                    if entry.availability_online {
                        entry.availability_online = false;
                        broker
                            .publish(broker::availability_topic(mac), b"offline".to_vec(), true)
                            .await;
                    }
                }
            }
            ClientEvent::ReconnectScheduled { delay } => {
                log::debug!("[{email}] Cloud reconnect in {}s", delay.as_secs());
            }
            ClientEvent::Message { topic, payload } => {
                self.handle_cloud_message(&topic, &payload, devices, broker)
                    .await;
            }
        }
    }

    async fn handle_cloud_message(
        &mut self,
        topic: &str,
        payload: &[u8],
        devices: &mut HashMap<String, DeviceEntry>,
        broker: &BrokerClient,
    ) {
        let Some((mac, kind)) = cloud::parse_response_topic(topic) else {
            log::debug!("Ignoring message on unexpected cloud topic {topic:?}");
            return;
        };
        let mac = mac.to_string();
        let Some(entry) = devices.get_mut(&mac) else {
            log::debug!("Ignoring message for unknown device {mac}");
            return;
        };

        entry.last_seen = Some(Utc::now());
        if !entry.availability_online {
            entry.availability_online = true;
            broker
                .publish(broker::availability_topic(&mac), b"online".to_vec(), true)
                .await;
        }

        let source = match kind {
            ResponseTopic::CommandResponse => UpdateSource::CommandResponse,
            ResponseTopic::Poll => UpdateSource::Poll,
            ResponseTopic::State => {
                // Liveness only; the payload is undocumented.
                log::trace!("State message from {mac}: {} bytes", payload.len());
                return;
            }
        };

        let update = match modbus::parse_response(payload) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropping malformed frame from {mac}: {e}");
                return;
            }
        };

        self.state.apply(&mac, &update, source);
        if let Some(state_json) = self.state.project(&mac, &entry.device.model) {
            broker
                .publish(
                    broker::state_topic(&mac),
                    state_json.to_string().into_bytes(),
                    true,
                )
                .await;
        }
    }

    async fn handle_broker_event(
        &mut self,
        event: BrokerEvent,
        accounts: &HashMap<String, AccountEntry>,
        devices: &mut HashMap<String, DeviceEntry>,
        broker: &BrokerClient,
    ) {
        match event {
            BrokerEvent::Connected => {
                // Retained messages may be stale after a broker restart;
                // push the current picture again.
                for (mac, entry) in devices.iter() {
                    let availability: &[u8] = if entry.availability_online {
                        b"online"
                    } else {
                        b"offline"
                    };
                    broker
                        .publish(
                            broker::availability_topic(mac),
                            availability.to_vec(),
                            true,
                        )
                        .await;
                    if let Some(state_json) = self.state.project(mac, &entry.device.model) {
                        broker
                            .publish(
                                broker::state_topic(mac),
                                state_json.to_string().into_bytes(),
                                true,
                            )
                            .await;
                    }
                }
            }
            BrokerEvent::Disconnected => {
                log::debug!("Local broker connection lost; cloud processing continues");
            }
            BrokerEvent::Message { topic, payload } => {
                self.handle_command(&topic, &payload, accounts, devices);
            }
        }
    }

    fn handle_command(
        &mut self,
        topic: &str,
        payload: &[u8],
        accounts: &HashMap<String, AccountEntry>,
        devices: &mut HashMap<String, DeviceEntry>,
    ) {
        let Some(mac) = broker::command_topic_mac(topic) else {
            log::debug!("Ignoring broker message on {topic:?}");
            return;
        };
        let mac = mac.to_string();
        let Some(entry) = devices.get_mut(&mac) else {
            log::warn!("Dropping command for unknown device {mac}");
            return;
        };
        let command = match Command::parse(payload) {
            Ok(command) => command,
            Err(e) => {
                log::warn!("Dropping invalid command for {mac}: {e}");
                return;
            }
        };
        let Some(account) = accounts.get(&entry.account) else {
            log::warn!("Dropping command for {mac}: its account is not connected yet");
            return;
        };

        match command.kind() {
            CommandKind::Output => {
                log::info!("Sending {command:?} to {mac}");
                account.client.publish(
                    cloud::device_request_topic(&mac),
                    command.to_frame(),
                    QoS::AtLeastOnce,
                );
                entry.last_command_at = Some(Instant::now());
            }
            CommandKind::Refresh => {
                log::info!("Requesting an immediate poll of {mac}");
                account.client.publish(
                    cloud::device_request_topic(&mac),
                    modbus::build_poll_request(),
                    QoS::AtLeastOnce,
                );
            }
            CommandKind::Setting => {
                let now = Instant::now();
                if entry.pending_settings.is_empty() && now >= entry.next_settings_at {
                    log::info!("Sending {command:?} to {mac}");
                    account.client.publish(
                        cloud::device_request_topic(&mac),
                        command.to_frame(),
                        QoS::AtLeastOnce,
                    );
                    entry.last_command_at = Some(now);
                    entry.next_settings_at = now + SETTINGS_SPACING;
                    entry.pending_refresh_at = Some(now + SETTINGS_REFRESH_DELAY);
                } else {
                    log::debug!(
                        "Queueing {command:?} for {mac} to keep settings writes {}s apart",
                        SETTINGS_SPACING.as_secs()
                    );
                    entry
                        .pending_settings
                        .push_back((command.to_frame(), now));
                }
            }
        }
    }

    /// Sends due queued settings writes and due post-settings refreshes.
    fn drain_pacing_queues(
        &mut self,
        accounts: &HashMap<String, AccountEntry>,
        devices: &mut HashMap<String, DeviceEntry>,
    ) {
        let now = Instant::now();
        for (mac, entry) in devices.iter_mut() {
            let Some(account) = accounts.get(&entry.account) else {
                continue;
            };

            if now >= entry.next_settings_at {
                if let Some((frame, enqueued_at)) = entry.pending_settings.pop_front() {
                    log::debug!(
                        "Sending queued settings write to {mac} after {}ms of spacing delay",
                        enqueued_at.elapsed().as_millis()
                    );
                    account.client.publish(
                        cloud::device_request_topic(mac),
                        frame,
                        QoS::AtLeastOnce,
                    );
                    entry.last_command_at = Some(now);
                    entry.next_settings_at = now + SETTINGS_SPACING;
                    entry.pending_refresh_at = Some(now + SETTINGS_REFRESH_DELAY);
                }
            }

            if entry.pending_refresh_at.is_some_and(|at| now >= at) {
                entry.pending_refresh_at = None;
                log::debug!("Post-settings refresh poll for {mac}");
                account.client.publish(
                    cloud::device_request_topic(mac),
                    modbus::build_poll_request(),
                    QoS::AtLeastOnce,
                );
            }
        }
    }

    fn poll_devices(
        &self,
        accounts: &HashMap<String, AccountEntry>,
        devices: &HashMap<String, DeviceEntry>,
    ) {
        for (mac, entry) in devices {
            if entry
                .last_command_at
                .is_some_and(|at| at.elapsed() < POST_COMMAND_POLL_SUPPRESSION)
            {
                log::trace!("Skipping poll of {mac}: a command response is in flight");
                continue;
            }
            let Some(account) = accounts.get(&entry.account) else {
                continue;
            };
            account.client.publish(
                cloud::device_request_topic(mac),
                modbus::build_poll_request(),
                QoS::AtLeastOnce,
            );
        }
    }

    fn handle_setup(
        &mut self,
        message: SetupMsg,
        accounts: &mut HashMap<String, AccountEntry>,
        devices: &mut HashMap<String, DeviceEntry>,
        cloud_events_tx: &mpsc::UnboundedSender<(String, ClientEvent)>,
        delay_min: Duration,
        delay_max: Duration,
    ) {
        match message {
            SetupMsg::Initial {
                email,
                devices: found,
                auth,
            } => {
                let subscriptions: Vec<String> = found
                    .iter()
                    .flat_map(|d| cloud::device_response_filters(&d.mac))
                    .collect();
                log::info!("[{email}] Starting cloud client for {} devices", found.len());
                let client = CloudClient::spawn(
                    CloudClientOptions {
                        account: email.clone(),
                        subscriptions,
                        reconnect_delay_min: delay_min,
                        reconnect_delay_max: delay_max,
                        ca_file: self.config.cloud.ca_file.clone(),
                    },
                    auth.clone(),
                    cloud_events_tx.clone(),
                    CancellationToken::new(),
                );
                for device in found {
                    devices
                        .entry(device.mac.clone())
                        .or_insert_with(|| DeviceEntry::new(device, email.clone()));
                }
                accounts.insert(
                    email,
                    AccountEntry {
                        client,
                        auth,
                        connected: false,
                    },
                );
            }
            SetupMsg::Refresh {
                email,
                devices: found,
            } => {
                let Some(account) = accounts.get(&email) else {
                    return;
                };
                for device in found {
                    if devices.contains_key(&device.mac) {
                        continue;
                    }
                    log::info!("[{email}] New device {} discovered", device.mac);
                    for filter in cloud::device_response_filters(&device.mac) {
                        account.client.subscribe(filter);
                    }
                    devices.insert(
                        device.mac.clone(),
                        DeviceEntry::new(device, email.clone()),
                    );
                }
            }
        }
    }

    async fn publish_status(
        &self,
        accounts: &HashMap<String, AccountEntry>,
        devices: &HashMap<String, DeviceEntry>,
        broker: &BrokerClient,
        started_at: Instant,
        status: &str,
    ) {
        let account_rows: Vec<AccountStatus> = accounts
            .iter()
            .map(|(email, entry)| AccountStatus {
                email: email.clone(),
                connected: entry.client.is_connected(),
                device_count: devices.values().filter(|d| &d.account == email).count(),
            })
            .collect();
        let device_rows: Vec<DeviceStatus> = devices
            .iter()
            .map(|(mac, entry)| DeviceStatus {
                id: mac.clone(),
                name: entry.device.name.clone(),
                model: entry.device.model.clone(),
                cloud_connected: accounts
                    .get(&entry.account)
                    .map(|a| a.client.is_connected())
                    .unwrap_or(false),
                last_seen: entry.last_seen,
            })
            .collect();

        let report = status::build_status(
            status,
            started_at.elapsed().as_secs(),
            &account_rows,
            &device_rows,
        );
        broker
            .publish(
                broker::BRIDGE_STATUS_TOPIC.to_string(),
                report.to_string().into_bytes(),
                true,
            )
            .await;
    }
}

/// Acquires tokens and lists devices off the orchestrator loop,
/// retrying every five minutes until it works or the bridge stops.
fn spawn_discovery(
    api: ApiClient,
    cache: DeviceCache,
    auth: AuthEngine,
    setup_tx: mpsc::UnboundedSender<SetupMsg>,
    cancellation: CancellationToken,
    is_refresh: bool,
) {
    const RETRY: Duration = Duration::from_secs(300);
    tokio::spawn(async move {
        let email = auth.email().to_string();
        loop {
            let attempt = async {
                let tokens = auth.acquire().await?;
                discovery::discover(&api, &cache, &email, &tokens).await
            };
            tokio::select! {
                _ = cancellation.cancelled() => return,
                result = attempt => match result {
                    Ok(devices) => {
                        let message = if is_refresh {
                            SetupMsg::Refresh { email, devices }
                        } else {
                            SetupMsg::Initial { email, devices, auth }
                        };
                        let _ = setup_tx.send(message);
                        return;
                    }
                    Err(e) => {
                        log::error!(
                            "[{email}] Account setup failed: {e}; retrying in {}s",
                            RETRY.as_secs()
                        );
                        tokio::select! {
                            _ = cancellation.cancelled() => return,
                            _ = tokio::time::sleep(RETRY) => {}
                        }
                    }
                }
            }
        }
    });
}
