use std::fmt;

/// Three-axis vector
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Accelerometer, gyroscope and Euler angle frame (flag 0x61)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InertialSample {
    /// Acceleration, ±16 g range scaled by 9.81
    pub accel: Vec3,
    /// Angular velocity (deg/s)
    pub angular_velocity: Vec3,
    /// Roll angle (deg)
    pub roll: f64,
    /// Pitch angle (deg)
    pub pitch: f64,
    /// Yaw angle (deg)
    pub yaw: f64,
}

/// Raw magnetometer counts, unscaled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MagneticSample {
    pub hx: i16,
    pub hy: i16,
    pub hz: i16,
}

/// Orientation quaternion, each component in [-1, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuaternionSample {
    pub q0: f64,
    pub q1: f64,
    pub q2: f64,
    pub q3: f64,
}

/// One decoded telemetry frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorSample {
    Inertial(InertialSample),
    Magnetic(MagneticSample),
    Quaternion(QuaternionSample),
    Temperature { celsius: f64 },
    /// Frame with a flag this crate does not decode
    Unknown { flag: u8, sub_flag: Option<u8> },
}

impl SensorSample {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown { .. })
    }
}

impl fmt::Display for SensorSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inertial(s) => write!(
                f,
                "X {:6.1}g    Y {:6.1}g    Z {:6.1}g\nRoll {:6.1}°    Pitch {:6.1}°    Yaw {:6.1}°",
                s.accel.x, s.accel.y, s.accel.z, s.roll, s.pitch, s.yaw
            ),
            Self::Magnetic(m) => write!(f, "Hx: {:5}   Hy: {:5}   Hz: {:5}", m.hx, m.hy, m.hz),
            Self::Quaternion(q) => write!(
                f,
                "Q0: {:6.1}   Q1: {:6.1}   Q2: {:6.1}   Q3: {:6.1}",
                q.q0, q.q1, q.q2, q.q3
            ),
            Self::Temperature { celsius } => write!(f, "Temperature[°C]: {}", celsius),
            Self::Unknown {
                flag,
                sub_flag: Some(sub),
            } => write!(f, "Unknown sub data flag: 0x{:02X} (flag 0x{:02X})", sub, flag),
            Self::Unknown {
                flag,
                sub_flag: None,
            } => write!(f, "Unknown data flag: 0x{:02X}", flag),
        }
    }
}

/// Latest attitude, published for rendering
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Orientation {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl From<&InertialSample> for Orientation {
    fn from(s: &InertialSample) -> Self {
        Self {
            roll: s.roll,
            pitch: s.pitch,
            yaw: s.yaw,
        }
    }
}

/// Session connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Ready,
    Disconnected { reason: String },
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// States from which `begin()` may start a new scan
    pub fn can_begin(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Disconnected { .. } | Self::Failed { .. }
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::Connecting => write!(f, "connecting"),
            Self::DiscoveringServices => write!(f, "discovering services"),
            Self::DiscoveringCharacteristics => write!(f, "discovering characteristics"),
            Self::Ready => write!(f, "ready"),
            Self::Disconnected { reason } => write!(f, "disconnected ({})", reason),
            Self::Failed { reason } => write!(f, "failed ({})", reason),
        }
    }
}

/// Events published to the session consumer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    Sample(SensorSample),
    Diagnostic(StatusMessage),
    ConnectionLost { reason: String },
    CalibrationStarted,
    CalibrationFinished { saved: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Warning,
    Error,
}
