//! One live MQTT-over-WebSocket session to the vendor cloud.
//!
//! A session owns the WebSocket, the raw receive buffer and the pending
//! packet-id maps. WebSocket frames carry MQTT packets with no alignment
//! guarantee, so every received chunk is appended to the buffer and the
//! buffer is re-drained through the incremental decoder. The session
//! ends with a [`SessionEnd`] reason; the reconnect controller decides
//! what happens next. Parser state never survives a session: a new
//! connection starts with an empty buffer.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use bytes::BytesMut;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::cloud::{MQTT_PASSWORD, MQTT_URL};
use crate::mqtt::{self, codec, CodecError, Connect, ConnectReturnCode, Packet, Publish, QoS, Subscribe};

use super::{ClientCommand, ClientEvent};

const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNACK_TIMEOUT: Duration = Duration::from_secs(15);
const PUBACK_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub(crate) enum SessionError {
    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("unable to read the CA bundle: {0}")]
    CaBundle(std::io::Error),
    #[error("WebSocket connect failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out establishing the WebSocket connection")]
    ConnectTimeout,
    #[error("no CONNACK arrived in time")]
    ConnAckTimeout,
    #[error("connection closed during the MQTT handshake")]
    ClosedDuringHandshake,
    #[error("expected CONNACK, received another packet first")]
    UnexpectedHandshakePacket,
    #[error("protocol error during the MQTT handshake: {0}")]
    Handshake(#[from] CodecError),
    #[error("cloud rejected the MQTT credential (CONNACK {0:?})")]
    CredentialsRejected(ConnectReturnCode),
    #[error("cloud refused the session (CONNACK {0:?})")]
    Refused(ConnectReturnCode),
}

/// Why a running session ended.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// Shutdown was requested; no reconnect.
    Shutdown,
    /// The peer closed the WebSocket or the stream errored.
    Transport(String),
    /// No traffic for 1.5x the keep-alive interval.
    KeepAliveTimeout,
    /// The byte stream became undecodable.
    Protocol(CodecError),
}

/// Monotonic 16-bit packet-id allocator; wraps 65535 -> 1, never 0.
#[derive(Debug, Default)]
pub(crate) struct PacketIds {
    last: u16,
}

impl PacketIds {
    pub(crate) fn next(&mut self) -> u16 {
        self.last = if self.last == u16::MAX { 1 } else { self.last + 1 };
        self.last
    }
}

fn client_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("client_{}_{}", &hex[..24], Utc::now().timestamp_millis())
}

fn tls_connector(ca_file: Option<&Path>) -> Result<native_tls::TlsConnector, SessionError> {
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(path) = ca_file {
        let pem = std::fs::read(path).map_err(SessionError::CaBundle)?;
        let cert = native_tls::Certificate::from_pem(&pem)?;
        builder.add_root_certificate(cert);
    }
    Ok(builder.build()?)
}

pub(crate) struct Session {
    account: String,
    ws: WsStream,
    rx_buf: BytesMut,
    packet_ids: PacketIds,
    pending_subscribes: HashMap<u16, Vec<String>>,
    pending_publishes: HashMap<u16, Instant>,
    last_rx: Instant,
    last_tx: Instant,
}

impl Session {
    /// Opens the WebSocket with the `mqtt` subprotocol. The MQTT
    /// handshake is a separate step so the controller can report both
    /// phases.
    pub(crate) async fn open(account: &str, ca_file: Option<&Path>) -> Result<Session, SessionError> {
        let connector = tls_connector(ca_file)?;
        let mut request = MQTT_URL
            .into_client_request()
            .expect("the MQTT URL is a valid client request");
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));

        log::debug!("[{account}] Opening WebSocket to {MQTT_URL}");
        let connect = connect_async_tls_with_config(
            request,
            None,
            false,
            Some(Connector::NativeTls(connector)),
        );
        let (ws, _response) = tokio::time::timeout(WS_CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| SessionError::ConnectTimeout)??;

        Ok(Session {
            account: account.to_string(),
            ws,
            rx_buf: BytesMut::new(),
            packet_ids: PacketIds::default(),
            pending_subscribes: HashMap::new(),
            pending_publishes: HashMap::new(),
            last_rx: Instant::now(),
            last_tx: Instant::now(),
        })
    }

    /// Performs the MQTT CONNECT/CONNACK exchange. Codes 4/5 surface as
    /// [`SessionError::CredentialsRejected`] so the caller can purge the
    /// MQTT token.
    pub(crate) async fn handshake(&mut self, mqtt_token: &str) -> Result<(), SessionError> {
        let connect = Packet::Connect(Connect {
            client_id: client_id(),
            username: mqtt_token.to_string(),
            password: MQTT_PASSWORD.to_string(),
            keep_alive_secs: KEEP_ALIVE.as_secs() as u16,
            clean_session: true,
        });
        self.send_packet(&connect)
            .await
            .map_err(SessionError::WebSocket)?;

        let deadline = Instant::now() + CONNACK_TIMEOUT;
        loop {
            if let Some(packet) = codec::decode(&mut self.rx_buf)? {
                let Packet::ConnAck(ack) = packet else {
                    return Err(SessionError::UnexpectedHandshakePacket);
                };
                return match ack.code {
                    ConnectReturnCode::Accepted => {
                        log::info!("[{}] MQTT session accepted by the cloud", self.account);
                        Ok(())
                    }
                    code if code.is_credential_failure() => {
                        Err(SessionError::CredentialsRejected(code))
                    }
                    code => Err(SessionError::Refused(code)),
                };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::ConnAckTimeout);
            }
            let frame = tokio::time::timeout(remaining, self.ws.next())
                .await
                .map_err(|_| SessionError::ConnAckTimeout)?;
            match frame {
                Some(Ok(Message::Binary(data))) => self.rx_buf.extend_from_slice(&data),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SessionError::WebSocket(e)),
                None => return Err(SessionError::ClosedDuringHandshake),
            }
        }
    }

    /// Subscribes to every topic in one SUBSCRIBE packet per chunk and
    /// records them as pending until the SUBACK arrives.
    pub(crate) async fn subscribe(
        &mut self,
        topics: &[String],
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        // The cloud handles moderate filter lists fine; chunk anyway so
        // one device-heavy account cannot produce an oversized packet.
        for chunk in topics.chunks(32) {
            let pkid = self.packet_ids.next();
            let packet = Packet::Subscribe(Subscribe {
                pkid,
                filters: chunk
                    .iter()
                    .map(|t| (t.clone(), QoS::AtLeastOnce))
                    .collect(),
            });
            self.pending_subscribes.insert(pkid, chunk.to_vec());
            self.send_packet(&packet).await?;
        }
        Ok(())
    }

    /// Runs the session until shutdown or failure, draining commands and
    /// emitting decoded publishes as events.
    pub(crate) async fn run(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
        events: &mpsc::UnboundedSender<(String, ClientEvent)>,
        subscriptions: &mut std::collections::BTreeSet<String>,
        cancellation: &CancellationToken,
    ) -> SessionEnd {
        let mut keepalive_tick = tokio::time::interval(KEEP_ALIVE / 2);
        keepalive_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    log::debug!("[{}] Stopping session because of cancellation", self.account);
                    self.send_disconnect().await;
                    return SessionEnd::Shutdown;
                }
                frame = self.ws.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        self.last_rx = Instant::now();
                        self.rx_buf.extend_from_slice(&data);
                        if let Err(end) = self.drain_packets(events).await {
                            return end;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Transport(format!("peer closed the WebSocket: {frame:?}"));
                    }
                    Some(Ok(_)) => {
                        // Text/ping/pong frames carry no MQTT data; pings
                        // are answered by the WebSocket layer itself.
                        self.last_rx = Instant::now();
                    }
                    Some(Err(e)) => return SessionEnd::Transport(e.to_string()),
                    None => return SessionEnd::Transport("WebSocket stream ended".to_string()),
                },
                command = commands.recv() => match command {
                    None | Some(ClientCommand::Shutdown) => {
                        self.send_disconnect().await;
                        return SessionEnd::Shutdown;
                    }
                    Some(ClientCommand::Publish { topic, payload, qos }) => {
                        if let Err(e) = self.publish(&topic, payload, qos).await {
                            return SessionEnd::Transport(e.to_string());
                        }
                    }
                    Some(ClientCommand::Subscribe { topic }) => {
                        subscriptions.insert(topic.clone());
                        if let Err(e) = self.subscribe(&[topic]).await {
                            return SessionEnd::Transport(e.to_string());
                        }
                    }
                },
                _ = keepalive_tick.tick() => {
                    if self.last_rx.elapsed() > KEEP_ALIVE * 3 / 2 {
                        log::warn!(
                            "[{}] No traffic for {}s, treating the connection as dead",
                            self.account,
                            self.last_rx.elapsed().as_secs()
                        );
                        return SessionEnd::KeepAliveTimeout;
                    }
                    if self.last_tx.elapsed() >= KEEP_ALIVE / 2 {
                        if let Err(e) = self.send_packet(&Packet::PingReq).await {
                            return SessionEnd::Transport(e.to_string());
                        }
                    }
                    self.expire_stale_publishes();
                }
            }
        }
    }

    async fn drain_packets(
        &mut self,
        events: &mpsc::UnboundedSender<(String, ClientEvent)>,
    ) -> Result<(), SessionEnd> {
        loop {
            match codec::decode(&mut self.rx_buf) {
                Ok(None) => return Ok(()),
                Ok(Some(packet)) => self.handle_packet(packet, events).await?,
                Err(CodecError::UnknownPacket(header)) => {
                    log::warn!(
                        "[{}] Dropping packet with unexpected type {header:#04x}",
                        self.account
                    );
                }
                Err(e) => {
                    log::warn!("[{}] Undecodable MQTT stream: {e}", self.account);
                    return Err(SessionEnd::Protocol(e));
                }
            }
        }
    }

    async fn handle_packet(
        &mut self,
        packet: Packet,
        events: &mpsc::UnboundedSender<(String, ClientEvent)>,
    ) -> Result<(), SessionEnd> {
        match packet {
            Packet::Publish(Publish { topic, payload, qos, pkid, .. }) => {
                if qos == QoS::AtLeastOnce {
                    if let Some(pkid) = pkid {
                        self.send_packet(&Packet::PubAck { pkid })
                            .await
                            .map_err(|e| SessionEnd::Transport(e.to_string()))?;
                    }
                }
                let _ = events.send((
                    self.account.clone(),
                    ClientEvent::Message { topic, payload },
                ));
            }
            Packet::PubAck { pkid } => match self.pending_publishes.remove(&pkid) {
                Some(sent_at) => log::trace!(
                    "[{}] PUBACK for {pkid} after {}ms",
                    self.account,
                    sent_at.elapsed().as_millis()
                ),
                None => log::debug!("[{}] PUBACK for unknown packet id {pkid}", self.account),
            },
            Packet::SubAck(ack) => {
                let failed = ack.return_codes.iter().filter(|c| **c == 0x80).count();
                if failed > 0 {
                    log::warn!(
                        "[{}] Cloud refused {failed} subscription(s) in SUBACK {}",
                        self.account,
                        ack.pkid
                    );
                }
                match self.pending_subscribes.remove(&ack.pkid) {
                    Some(topics) => log::debug!(
                        "[{}] {} subscription(s) active",
                        self.account,
                        topics.len()
                    ),
                    None => log::debug!(
                        "[{}] SUBACK for unknown packet id {}",
                        self.account,
                        ack.pkid
                    ),
                }
            }
            Packet::PingResp => log::trace!("[{}] PINGRESP", self.account),
            other => {
                log::warn!("[{}] Ignoring unexpected packet {other:?}", self.account);
            }
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let pkid = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => {
                let pkid = self.packet_ids.next();
                self.pending_publishes.insert(pkid, Instant::now());
                Some(pkid)
            }
        };
        let packet = Packet::Publish(Publish {
            topic: topic.to_string(),
            payload,
            qos,
            pkid,
            retain: false,
            dup: false,
        });
        self.send_packet(&packet).await
    }

    /// QoS-1 publishes keep no retransmission buffer; an unacknowledged
    /// one is only worth a log line because the poll timer refreshes the
    /// same state soon anyway.
    fn expire_stale_publishes(&mut self) {
        let account = &self.account;
        self.pending_publishes.retain(|pkid, sent_at| {
            if sent_at.elapsed() > PUBACK_TIMEOUT {
                log::warn!("[{account}] No PUBACK for packet {pkid} within 10s, giving up on it");
                false
            } else {
                true
            }
        });
    }

    async fn send_packet(
        &mut self,
        packet: &Packet,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut buf = BytesMut::new();
        mqtt::encode(packet, &mut buf);
        self.ws.send(Message::Binary(buf.to_vec())).await?;
        self.last_tx = Instant::now();
        Ok(())
    }

    async fn send_disconnect(&mut self) {
        if let Err(e) = self.send_packet(&Packet::Disconnect).await {
            log::debug!("[{}] Unable to send DISCONNECT: {e}", self.account);
        }
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_wrap_past_the_maximum_without_zero() {
        let mut ids = PacketIds::default();
        assert_eq!(ids.next(), 1);
        ids.last = u16::MAX - 1;
        assert_eq!(ids.next(), u16::MAX);
        assert_eq!(ids.next(), 1);
    }

    #[test]
    fn packet_ids_never_yield_zero_over_a_full_cycle() {
        let mut ids = PacketIds::default();
        for _ in 0..=u16::MAX as u32 + 10 {
            assert_ne!(ids.next(), 0);
        }
    }

    #[test]
    fn client_id_matches_the_required_format() {
        let id = client_id();
        let mut parts = id.splitn(3, '_');
        assert_eq!(parts.next(), Some("client"));
        let hex = parts.next().unwrap();
        assert_eq!(hex.len(), 24);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        let millis = parts.next().unwrap();
        assert!(millis.chars().all(|c| c.is_ascii_digit()));
        assert!(millis.len() >= 13);
    }
}
