//! BLE Transport Abstraction
//!
//! The radio stack is supplied by the embedding application. The session only
//! issues requests through [`Transport`]; results and lifecycle changes come
//! back as [`TransportEvent`]s on a single channel, in delivery order.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Opaque transport-level identity of a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub String);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Transport handle of a discovered characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId(pub u64);

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A characteristic reported by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub id: CharacteristicId,
}

/// A received advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: Option<String>,
    pub id: PeripheralId,
    pub rssi: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("write failed: {0}")]
    Write(String),
}

impl TransportError {
    /// Underlying reason without the operation prefix
    pub fn detail(&self) -> String {
        match self {
            Self::Scan(reason)
            | Self::Connect(reason)
            | Self::Discovery(reason)
            | Self::Write(reason) => reason.clone(),
        }
    }
}

/// Everything the transport reports back to the session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Advertisement(Advertisement),
    ScanFailed { reason: String },
    Connected(PeripheralId),
    ConnectFailed { id: PeripheralId, reason: String },
    ServicesDiscovered(Vec<Uuid>),
    CharacteristicsDiscovered {
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    },
    DiscoveryFailed { reason: String },
    Notification {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    WriteCompleted {
        characteristic: CharacteristicId,
        result: Result<(), String>,
    },
    Disconnected { reason: Option<String> },
}

/// Requests the session issues to the radio stack
///
/// Every call only starts an operation; its outcome arrives later as a
/// [`TransportEvent`]. An `Err` means the request could not be submitted.
pub trait Transport {
    fn start_scan(&mut self, service: Uuid, allow_duplicates: bool) -> Result<(), TransportError>;

    fn stop_scan(&mut self) -> Result<(), TransportError>;

    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    fn discover_services(
        &mut self,
        peripheral: &PeripheralId,
        services: &[Uuid],
    ) -> Result<(), TransportError>;

    fn discover_characteristics(
        &mut self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), TransportError>;

    fn set_notify(
        &mut self,
        characteristic: CharacteristicId,
        enabled: bool,
    ) -> Result<(), TransportError>;

    fn write(
        &mut self,
        characteristic: CharacteristicId,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;
}
