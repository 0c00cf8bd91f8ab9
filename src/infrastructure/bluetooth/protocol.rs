//! WT901BLECL Protocol
//!
//! GATT identifiers, outbound command frames and inbound telemetry decoding
//! for the WitMotion WT901BLECL IMU.

use crate::domain::models::{InertialSample, MagneticSample, QuaternionSample, SensorSample, Vec3};
use thiserror::Error;
use tracing::{trace, warn};
use uuid::Uuid;

/// IMU BLE Service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe5_0000_1000_8000_00805f9a34fb);

/// Notify Characteristic UUID - where telemetry frames are pushed
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe4_0000_1000_8000_00805f9a34fb);

/// Write Characteristic UUID - where command frames are sent
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe9_0000_1000_8000_00805f9a34fb);

/// Advertised name prefix of compatible devices
pub const DEVICE_NAME_PREFIX: &str = "WT901BLE";

/// Telemetry frame length
pub const FRAME_LEN: usize = 20;

/// Command frame length
pub const COMMAND_LEN: usize = 5;

/// Command frame header
const COMMAND_HEADER: [u8; 2] = [0xFF, 0xAA];

/// Primary flag of the periodic inertial push
pub const FLAG_INERTIAL: u8 = 0x61;

/// Primary flag of a register read reply
pub const FLAG_REGISTER: u8 = 0x71;

/// Command registers
pub mod register {
    pub const SAVE: u8 = 0x00;
    pub const CALIBRATE: u8 = 0x01;
    pub const RATE: u8 = 0x03;
    pub const READ: u8 = 0x27;
}

/// Scaling of raw i16 counts
pub mod scale {
    /// Raw counts are normalized by this before applying a range
    pub const FULL_SCALE: f64 = 32768.0;
    /// Gravity constant used by the device firmware
    pub const GRAVITY: f64 = 9.81;
    /// ±16 g accelerometer range
    pub const ACCEL_RANGE: f64 = 16.0 * GRAVITY;
    /// ±2000 deg/s gyroscope range
    pub const GYRO_RANGE: f64 = 2000.0;
    /// ±180 deg Euler angles
    pub const ANGLE_RANGE: f64 = 180.0;
    /// Temperature is reported in hundredths of a degree
    pub const TEMPERATURE_DIVISOR: f64 = 100.0;
}

/// Register read replies the polling cycle asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubFrame {
    Magnetic,
    Quaternion,
    Temperature,
}

impl SubFrame {
    /// Register address, echoed back at byte 2 of the reply
    pub fn register(self) -> u8 {
        match self {
            Self::Magnetic => 0x3a,
            Self::Quaternion => 0x51,
            Self::Temperature => 0x40,
        }
    }

    pub fn from_register(register: u8) -> Option<Self> {
        match register {
            0x3a => Some(Self::Magnetic),
            0x51 => Some(Self::Quaternion),
            0x40 => Some(Self::Temperature),
            _ => None,
        }
    }
}

/// Output rates supported by the device (0.2 and 0.5 Hz are not exposed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleRate {
    Hz1,
    Hz2,
    Hz5,
    #[default]
    Hz10,
    Hz20,
    Hz50,
}

impl SampleRate {
    /// Map a frequency in Hz to a supported rate, falling back to 10 Hz
    pub fn from_hz(hz: u32) -> Self {
        Self::try_from_hz(hz).unwrap_or_else(|| {
            warn!("Unsupported update rate {} Hz, using 10 Hz", hz);
            Self::Hz10
        })
    }

    pub fn try_from_hz(hz: u32) -> Option<Self> {
        match hz {
            1 => Some(Self::Hz1),
            2 => Some(Self::Hz2),
            5 => Some(Self::Hz5),
            10 => Some(Self::Hz10),
            20 => Some(Self::Hz20),
            50 => Some(Self::Hz50),
            _ => None,
        }
    }

    /// Value written to the rate register
    pub fn code(self) -> u8 {
        match self {
            Self::Hz1 => 0x03,
            Self::Hz2 => 0x04,
            Self::Hz5 => 0x05,
            Self::Hz10 => 0x06,
            Self::Hz20 => 0x07,
            Self::Hz50 => 0x08,
        }
    }
}

/// Configuration and control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Set the periodic inertial output rate
    SetSampleRate(SampleRate),
    /// Ask for one register reply on the notify channel
    RequestSubFrame(SubFrame),
    /// Persist the current configuration
    SaveConfig,
    /// Restore factory configuration and save
    RestoreDefault,
    /// Accelerometer calibration
    CalibrateAccelerometer,
    /// Magnetometer calibration
    CalibrateMagnetometer,
    /// Leave calibration mode
    QuitCalibration,
}

impl Command {
    /// Rate command for an arbitrary frequency, unsupported values map to 10 Hz
    pub fn set_sample_rate(hz: u32) -> Self {
        Self::SetSampleRate(SampleRate::from_hz(hz))
    }

    /// Register and value bytes for this command
    pub fn register_value(&self) -> (u8, u8) {
        match self {
            Self::SetSampleRate(rate) => (register::RATE, rate.code()),
            Self::RequestSubFrame(sub) => (register::READ, sub.register()),
            Self::SaveConfig => (register::SAVE, 0x00),
            Self::RestoreDefault => (register::SAVE, 0x01),
            Self::CalibrateAccelerometer => (register::CALIBRATE, 0x01),
            Self::CalibrateMagnetometer => (register::CALIBRATE, 0x07),
            Self::QuitCalibration => (register::CALIBRATE, 0x00),
        }
    }

    /// Encode into the 5-byte wire frame `[FF AA reg value 00]`
    pub fn encode(&self) -> [u8; COMMAND_LEN] {
        let (reg, value) = self.register_value();
        [COMMAND_HEADER[0], COMMAND_HEADER[1], reg, value, 0x00]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid frame length: {actual} (expected {expected})")]
    InvalidLength { expected: usize, actual: usize },
}

fn read_i16(bytes: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Raw count normalized to [-1, 1)
fn read_normalized(bytes: &[u8], offset: usize) -> f64 {
    read_i16(bytes, offset) as f64 / scale::FULL_SCALE
}

/// Decode a 20-byte telemetry frame
///
/// # Frame Structure (20 bytes)
///
/// ```text
/// [0]      : Sync marker (0x55)
/// [1]      : Flag
///
/// Flag 0x61 (periodic push), nine i16 little-endian:
/// [2-7]    : Accel X, Y, Z     (/32768 * 16 * 9.81)
/// [8-13]   : Gyro X, Y, Z      (/32768 * 2000, deg/s)
/// [14-19]  : Roll, Pitch, Yaw  (/32768 * 180, deg)
///
/// Flag 0x71 (register reply):
/// [2]      : Register (0x3a magnetic, 0x51 quaternion, 0x40 temperature)
/// [3]      : Reserved
/// [4-..]   : i16 little-endian register values
/// ```
pub fn decode(bytes: &[u8]) -> Result<SensorSample, DecodeError> {
    if bytes.len() != FRAME_LEN {
        return Err(DecodeError::InvalidLength {
            expected: FRAME_LEN,
            actual: bytes.len(),
        });
    }

    trace!("Raw frame: {:02X?}", bytes);

    let sample = match bytes[1] {
        FLAG_INERTIAL => SensorSample::Inertial(decode_inertial(bytes)),
        FLAG_REGISTER => decode_register(bytes),
        flag => SensorSample::Unknown {
            flag,
            sub_flag: None,
        },
    };

    Ok(sample)
}

fn decode_inertial(bytes: &[u8]) -> InertialSample {
    InertialSample {
        accel: Vec3::new(
            read_normalized(bytes, 2) * scale::ACCEL_RANGE,
            read_normalized(bytes, 4) * scale::ACCEL_RANGE,
            read_normalized(bytes, 6) * scale::ACCEL_RANGE,
        ),
        angular_velocity: Vec3::new(
            read_normalized(bytes, 8) * scale::GYRO_RANGE,
            read_normalized(bytes, 10) * scale::GYRO_RANGE,
            read_normalized(bytes, 12) * scale::GYRO_RANGE,
        ),
        roll: read_normalized(bytes, 14) * scale::ANGLE_RANGE,
        pitch: read_normalized(bytes, 16) * scale::ANGLE_RANGE,
        yaw: read_normalized(bytes, 18) * scale::ANGLE_RANGE,
    }
}

fn decode_register(bytes: &[u8]) -> SensorSample {
    match SubFrame::from_register(bytes[2]) {
        Some(SubFrame::Magnetic) => SensorSample::Magnetic(MagneticSample {
            hx: read_i16(bytes, 4),
            hy: read_i16(bytes, 6),
            hz: read_i16(bytes, 8),
        }),
        Some(SubFrame::Quaternion) => SensorSample::Quaternion(QuaternionSample {
            q0: read_normalized(bytes, 4),
            q1: read_normalized(bytes, 6),
            q2: read_normalized(bytes, 8),
            q3: read_normalized(bytes, 10),
        }),
        Some(SubFrame::Temperature) => SensorSample::Temperature {
            celsius: read_i16(bytes, 4) as f64 / scale::TEMPERATURE_DIVISOR,
        },
        None => SensorSample::Unknown {
            flag: FLAG_REGISTER,
            sub_flag: Some(bytes[2]),
        },
    }
}
