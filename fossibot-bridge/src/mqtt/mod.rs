//! Minimal MQTT 3.1.1 packet model for the vendor cloud session.
//!
//! Only the packets the cloud actually exchanges are modelled: CONNECT,
//! CONNACK, PUBLISH (QoS 0/1), PUBACK, SUBSCRIBE, SUBACK, PINGREQ,
//! PINGRESP and DISCONNECT. The local broker leg uses a full client
//! (rumqttc) instead; this module exists because the cloud speaks MQTT
//! inside WebSocket binary frames with no alignment guarantees, so the
//! bridge needs its own incremental parser.

pub mod codec;

pub use codec::{decode, encode, CodecError};

pub const PROTOCOL_LEVEL: u8 = 4;

/// Quality of service. QoS 2 is never used by the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    pub fn from_bits(bits: u8) -> Option<QoS> {
        match bits {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

/// CONNACK return codes, per MQTT 3.1.1 table 3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocol,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
}

impl ConnectReturnCode {
    pub fn from_byte(byte: u8) -> Option<ConnectReturnCode> {
        match byte {
            0 => Some(ConnectReturnCode::Accepted),
            1 => Some(ConnectReturnCode::UnacceptableProtocol),
            2 => Some(ConnectReturnCode::IdentifierRejected),
            3 => Some(ConnectReturnCode::ServerUnavailable),
            4 => Some(ConnectReturnCode::BadCredentials),
            5 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }

    /// Codes 4 and 5 mean the MQTT token itself was rejected.
    pub fn is_credential_failure(self) -> bool {
        matches!(
            self,
            ConnectReturnCode::BadCredentials | ConnectReturnCode::NotAuthorized
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    /// Present iff `qos` is at-least-once.
    pub pkid: Option<u16>,
    pub retain: bool,
    pub dup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    /// One return code per requested filter; 0x80 marks failure.
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck { pkid: u16 },
    Subscribe(Subscribe),
    SubAck(SubAck),
    PingReq,
    PingResp,
    Disconnect,
}
