//! IMU Session State Machine
//!
//! [`SessionManager`] owns the connection lifecycle and never touches the
//! radio itself. Every input returns the [`Action`]s the caller must carry
//! out, in order, which keeps each transition testable without a device.

use crate::domain::models::{
    ConnectionState, MessageSeverity, SensorSample, SessionEvent, StatusMessage,
};
use crate::domain::polling::{PollingCycle, PollingSequencer};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{self, Command, SampleRate};
use crate::infrastructure::bluetooth::transport::{
    Advertisement, CharacteristicId, CharacteristicInfo, PeripheralId, TransportEvent,
};
use anyhow::Context;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Advertised name prefix a device must carry to be selected
    pub device_name_prefix: String,
    /// Service UUID to scan and discover
    pub service_uuid: Uuid,
    /// Telemetry characteristic UUID
    pub notify_char_uuid: Uuid,
    /// Command characteristic UUID
    pub write_char_uuid: Uuid,
    /// Report repeated advertisements from the same device while scanning
    pub allow_duplicates: bool,
    /// Rate written as soon as the write channel is found
    pub initial_rate: SampleRate,
    /// Time the device is left calibrating before the result is saved
    pub calibration_duration: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name_prefix: protocol::DEVICE_NAME_PREFIX.to_string(),
            service_uuid: protocol::SERVICE_UUID,
            notify_char_uuid: protocol::NOTIFY_CHAR_UUID,
            write_char_uuid: protocol::WRITE_CHAR_UUID,
            allow_duplicates: true,
            initial_rate: SampleRate::Hz1,
            calibration_duration: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let parse = |label: &str, value: &str| {
            Uuid::parse_str(value).with_context(|| format!("Invalid {} UUID: {}", label, value))
        };

        Ok(Self {
            device_name_prefix: settings.device_name_prefix.clone(),
            service_uuid: parse("service", &settings.ble_service_uuid)?,
            notify_char_uuid: parse("notify characteristic", &settings.ble_notify_char_uuid)?,
            write_char_uuid: parse("write characteristic", &settings.ble_write_char_uuid)?,
            allow_duplicates: settings.allow_duplicate_advertisements,
            initial_rate: SampleRate::from_hz(settings.initial_update_rate_hz),
            calibration_duration: Duration::from_millis(settings.calibration_duration_ms),
        })
    }
}

/// Negotiated device and its two channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub peripheral: PeripheralId,
    pub notify: CharacteristicId,
    pub write: CharacteristicId,
}

/// Identifies one armed calibration timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// An in-flight calibration window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationSession {
    pub deadline: Instant,
    pub timer: TimerToken,
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartScan {
        service: Uuid,
        allow_duplicates: bool,
    },
    StopScan,
    Connect(PeripheralId),
    DiscoverServices {
        peripheral: PeripheralId,
        services: Vec<Uuid>,
    },
    DiscoverCharacteristics {
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    SetNotify {
        characteristic: CharacteristicId,
        enabled: bool,
    },
    Write {
        characteristic: CharacteristicId,
        command: Command,
    },
    /// Deliver `SessionInput::CalibrationDeadline(token)` after `delay`
    ArmCalibrationTimer {
        token: TimerToken,
        delay: Duration,
    },
    CancelCalibrationTimer {
        token: TimerToken,
    },
    Emit(SessionEvent),
}

/// Everything the state machine reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Begin,
    SetUpdateRate(u32),
    Calibrate,
    SaveCurrentConfig,
    RestoreDefaultConfig,
    QuitCalibration,
    CalibrationDeadline(TimerToken),
    Transport(TransportEvent),
}

pub struct SessionManager {
    config: SessionConfig,
    state: ConnectionState,
    peripheral: Option<PeripheralId>,
    handle: Option<DeviceHandle>,
    polling: PollingSequencer,
    calibration: Option<CalibrationSession>,
    next_timer: u64,
    inertial_samples: u64,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            peripheral: None,
            handle: None,
            polling: PollingSequencer::new(),
            calibration: None,
            next_timer: 0,
            inertial_samples: 0,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn device_handle(&self) -> Option<&DeviceHandle> {
        self.handle.as_ref()
    }

    pub fn calibration(&self) -> Option<&CalibrationSession> {
        self.calibration.as_ref()
    }

    pub fn polling_cycle(&self) -> PollingCycle {
        self.polling.cycle()
    }

    /// Inertial frames decoded since the session was created
    pub fn inertial_sample_count(&self) -> u64 {
        self.inertial_samples
    }

    /// Single dispatch entry point
    pub fn handle(&mut self, input: SessionInput) -> Vec<Action> {
        match input {
            SessionInput::Begin => self.begin(),
            SessionInput::SetUpdateRate(hz) => self.set_update_rate(hz),
            SessionInput::Calibrate => self.calibrate(),
            SessionInput::SaveCurrentConfig => self.save_current_config(),
            SessionInput::RestoreDefaultConfig => self.restore_default_config(),
            SessionInput::QuitCalibration => self.quit_calibration(),
            SessionInput::CalibrationDeadline(token) => self.on_calibration_deadline(token),
            SessionInput::Transport(event) => self.handle_transport_event(event),
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Vec<Action> {
        match event {
            TransportEvent::Advertisement(adv) => self.on_advertisement(adv),
            TransportEvent::ScanFailed { reason } => self.on_scan_failed(&reason),
            TransportEvent::Connected(id) => self.on_connected(&id),
            TransportEvent::ConnectFailed { id, reason } => self.on_connect_failed(&id, &reason),
            TransportEvent::ServicesDiscovered(services) => self.on_services_discovered(&services),
            TransportEvent::CharacteristicsDiscovered {
                service,
                characteristics,
            } => self.on_characteristics_discovered(service, &characteristics),
            TransportEvent::DiscoveryFailed { reason } => self.on_discovery_failed(&reason),
            TransportEvent::Notification {
                characteristic,
                value,
            } => self.on_notification(characteristic, &value),
            TransportEvent::WriteCompleted {
                characteristic,
                result,
            } => self.on_write_completed(characteristic, result),
            TransportEvent::Disconnected { reason } => self.on_disconnected(reason),
        }
    }

    /// Start scanning for the IMU
    pub fn begin(&mut self) -> Vec<Action> {
        if !self.state.can_begin() {
            debug!("begin() ignored while {}", self.state);
            return Vec::new();
        }

        info!(
            "Scanning for {} devices on service {}",
            self.config.device_name_prefix, self.config.service_uuid
        );

        let mut actions = vec![Action::StartScan {
            service: self.config.service_uuid,
            allow_duplicates: self.config.allow_duplicates,
        }];
        self.set_state(ConnectionState::Scanning, &mut actions);
        actions
    }

    /// First advertisement with a matching name wins
    pub fn on_advertisement(&mut self, adv: Advertisement) -> Vec<Action> {
        if self.state != ConnectionState::Scanning || self.peripheral.is_some() {
            trace!("Advertisement from {} ignored", adv.id);
            return Vec::new();
        }

        let Some(name) = adv.name.as_deref() else {
            return Vec::new();
        };
        if !name.starts_with(&self.config.device_name_prefix) {
            trace!("Skipping {} ({})", name, adv.id);
            return Vec::new();
        }

        info!("{} found ({}, RSSI {} dBm)", name, adv.id, adv.rssi);
        self.peripheral = Some(adv.id.clone());

        let mut actions = vec![Action::StopScan, Action::Connect(adv.id)];
        self.set_state(ConnectionState::Connecting, &mut actions);
        actions
    }

    pub fn on_scan_failed(&mut self, reason: &str) -> Vec<Action> {
        if self.state != ConnectionState::Scanning {
            return Vec::new();
        }
        self.fail(format!("scan failed: {}", reason))
    }

    pub fn on_connected(&mut self, id: &PeripheralId) -> Vec<Action> {
        if self.state != ConnectionState::Connecting || self.peripheral.as_ref() != Some(id) {
            debug!("Unexpected connect event from {}", id);
            return Vec::new();
        }

        info!("Connected to {}", id);
        let mut actions = vec![Action::DiscoverServices {
            peripheral: id.clone(),
            services: vec![self.config.service_uuid],
        }];
        self.set_state(ConnectionState::DiscoveringServices, &mut actions);
        actions
    }

    pub fn on_connect_failed(&mut self, id: &PeripheralId, reason: &str) -> Vec<Action> {
        if self.state != ConnectionState::Connecting || self.peripheral.as_ref() != Some(id) {
            return Vec::new();
        }
        self.fail(format!("connect failed: {}", reason))
    }

    pub fn on_services_discovered(&mut self, services: &[Uuid]) -> Vec<Action> {
        if self.state != ConnectionState::DiscoveringServices {
            return Vec::new();
        }
        let Some(peripheral) = self.peripheral.clone() else {
            return Vec::new();
        };

        if !services.contains(&self.config.service_uuid) {
            return self.fail(format!("service {} not found", self.config.service_uuid));
        }

        debug!("Found IMU service, discovering characteristics");
        let mut actions = vec![Action::DiscoverCharacteristics {
            peripheral,
            service: self.config.service_uuid,
            characteristics: vec![self.config.notify_char_uuid, self.config.write_char_uuid],
        }];
        self.set_state(ConnectionState::DiscoveringCharacteristics, &mut actions);
        actions
    }

    pub fn on_discovery_failed(&mut self, reason: &str) -> Vec<Action> {
        match self.state {
            ConnectionState::DiscoveringServices | ConnectionState::DiscoveringCharacteristics => {
                self.fail(format!("discovery failed: {}", reason))
            }
            _ => Vec::new(),
        }
    }

    /// Enable telemetry, bootstrap the output rate and go ready
    pub fn on_characteristics_discovered(
        &mut self,
        service: Uuid,
        characteristics: &[CharacteristicInfo],
    ) -> Vec<Action> {
        if self.state != ConnectionState::DiscoveringCharacteristics
            || service != self.config.service_uuid
        {
            return Vec::new();
        }
        let Some(peripheral) = self.peripheral.clone() else {
            return Vec::new();
        };

        let mut notify = None;
        let mut write = None;
        for c in characteristics {
            if c.uuid == self.config.notify_char_uuid {
                notify = Some(c.id);
            } else if c.uuid == self.config.write_char_uuid {
                write = Some(c.id);
            } else {
                warn!("Characteristic not used: {}", c.uuid);
            }
        }

        let (notify, write) = match (notify, write) {
            (Some(n), Some(w)) => (n, w),
            (None, _) => return self.fail("notify characteristic not found".to_string()),
            (_, None) => return self.fail("write characteristic not found".to_string()),
        };

        info!("Channels ready (notify {}, write {})", notify, write);
        self.handle = Some(DeviceHandle {
            peripheral,
            notify,
            write,
        });
        self.polling.reset();

        let mut actions = vec![
            Action::SetNotify {
                characteristic: notify,
                enabled: true,
            },
            Action::Write {
                characteristic: write,
                command: Command::SetSampleRate(self.config.initial_rate),
            },
        ];
        self.set_state(ConnectionState::Ready, &mut actions);
        actions
    }

    /// Decode telemetry and keep the polling cycle going
    pub fn on_notification(
        &mut self,
        characteristic: CharacteristicId,
        value: &[u8],
    ) -> Vec<Action> {
        let Some(handle) = self.ready_handle() else {
            debug!("Notification while {} dropped", self.state);
            return Vec::new();
        };
        let write = handle.write;

        if characteristic != handle.notify {
            warn!("Notification from unknown characteristic {}", characteristic);
            return vec![diagnostic(
                format!("Unknown characteristic {}", characteristic),
                MessageSeverity::Warning,
            )];
        }

        let sample = match protocol::decode(value) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return vec![diagnostic(
                    format!("Dropped frame: {}", e),
                    MessageSeverity::Warning,
                )];
            }
        };

        if sample.is_unknown() {
            warn!("{}", sample);
            return Vec::new();
        }

        if let SensorSample::Inertial(inertial) = &sample {
            self.inertial_samples += 1;
            debug!(
                "Acc {:6.1} {:6.1} {:6.1}  AngVel {:6.1} {:6.1} {:6.1}  Ang {:6.1} {:6.1} {:6.1}",
                inertial.accel.x,
                inertial.accel.y,
                inertial.accel.z,
                inertial.angular_velocity.x,
                inertial.angular_velocity.y,
                inertial.angular_velocity.z,
                inertial.roll,
                inertial.pitch,
                inertial.yaw
            );
        } else {
            debug!("{}", sample);
        }

        let mut actions = Vec::with_capacity(2);
        if let Some(command) = self.polling.on_sample(&sample) {
            actions.push(Action::Write {
                characteristic: write,
                command,
            });
        }
        actions.push(Action::Emit(SessionEvent::Sample(sample)));
        actions
    }

    pub fn on_write_completed(
        &mut self,
        characteristic: CharacteristicId,
        result: Result<(), String>,
    ) -> Vec<Action> {
        match result {
            Ok(()) => {
                trace!("Write to {} acknowledged", characteristic);
                Vec::new()
            }
            Err(reason) => {
                warn!("Write to {} failed: {}", characteristic, reason);
                vec![diagnostic(
                    format!("Write to {} failed: {}", characteristic, reason),
                    MessageSeverity::Error,
                )]
            }
        }
    }

    /// Connection dropped; no automatic reconnect
    ///
    /// Only a session holding a peripheral can lose it. A drop reported while
    /// scanning belongs to the link of an earlier attempt.
    pub fn on_disconnected(&mut self, reason: Option<String>) -> Vec<Action> {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::DiscoveringServices
            | ConnectionState::DiscoveringCharacteristics
            | ConnectionState::Ready => {}
            _ => {
                debug!("Stale disconnect while {}: {:?}", self.state, reason);
                return Vec::new();
            }
        }

        let reason = reason.unwrap_or_else(|| "connection lost".to_string());
        warn!("Disconnected: {}", reason);

        let mut actions = Vec::new();
        self.teardown(&mut actions);
        self.set_state(
            ConnectionState::Disconnected {
                reason: reason.clone(),
            },
            &mut actions,
        );
        actions.push(Action::Emit(SessionEvent::ConnectionLost { reason }));
        actions
    }

    pub fn set_update_rate(&mut self, hz: u32) -> Vec<Action> {
        self.write(Command::set_sample_rate(hz))
    }

    pub fn save_current_config(&mut self) -> Vec<Action> {
        self.write(Command::SaveConfig)
    }

    pub fn restore_default_config(&mut self) -> Vec<Action> {
        self.write(Command::RestoreDefault)
    }

    /// Calibrate magnetometer then accelerometer, saving when the window ends
    pub fn calibrate(&mut self) -> Vec<Action> {
        let Some(write) = self.ready_handle().map(|h| h.write) else {
            return Vec::new();
        };
        if self.calibration.is_some() {
            debug!("Calibration already in progress");
            return Vec::new();
        }

        let token = TimerToken(self.next_timer);
        self.next_timer += 1;
        let delay = self.config.calibration_duration;
        self.calibration = Some(CalibrationSession {
            deadline: Instant::now() + delay,
            timer: token,
        });
        info!("Calibration started for {:?}", delay);

        vec![
            Action::Write {
                characteristic: write,
                command: Command::CalibrateMagnetometer,
            },
            Action::Write {
                characteristic: write,
                command: Command::CalibrateAccelerometer,
            },
            Action::ArmCalibrationTimer { token, delay },
            Action::Emit(SessionEvent::CalibrationStarted),
        ]
    }

    pub fn on_calibration_deadline(&mut self, token: TimerToken) -> Vec<Action> {
        match self.calibration {
            Some(session) if session.timer == token => {}
            _ => {
                debug!("Stale calibration timer {:?}", token);
                return Vec::new();
            }
        }
        self.calibration = None;

        let mut actions = self.write(Command::SaveConfig);
        let saved = !actions.is_empty();
        info!("Calibration finished (saved: {})", saved);
        actions.push(Action::Emit(SessionEvent::CalibrationFinished { saved }));
        actions
    }

    /// Leave calibration mode without saving
    pub fn quit_calibration(&mut self) -> Vec<Action> {
        let mut actions = self.write(Command::QuitCalibration);
        if actions.is_empty() {
            return actions;
        }
        if let Some(session) = self.calibration.take() {
            info!("Calibration aborted");
            actions.push(Action::CancelCalibrationTimer {
                token: session.timer,
            });
            actions.push(Action::Emit(SessionEvent::CalibrationFinished { saved: false }));
        }
        actions
    }

    fn ready_handle(&self) -> Option<&DeviceHandle> {
        if self.state.is_ready() {
            self.handle.as_ref()
        } else {
            None
        }
    }

    fn write(&self, command: Command) -> Vec<Action> {
        match self.ready_handle() {
            Some(handle) => vec![Action::Write {
                characteristic: handle.write,
                command,
            }],
            None => {
                debug!("{:?} ignored while {}", command, self.state);
                Vec::new()
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState, actions: &mut Vec<Action>) {
        if self.state == state {
            return;
        }
        info!("Session state: {} -> {}", self.state, state);
        self.state = state.clone();
        actions.push(Action::Emit(SessionEvent::StateChanged(state)));
    }

    fn teardown(&mut self, actions: &mut Vec<Action>) {
        if let Some(session) = self.calibration.take() {
            actions.push(Action::CancelCalibrationTimer {
                token: session.timer,
            });
            actions.push(Action::Emit(SessionEvent::CalibrationFinished { saved: false }));
        }
        self.handle = None;
        self.peripheral = None;
        self.polling.reset();
    }

    fn fail(&mut self, reason: String) -> Vec<Action> {
        error!("Session failed: {}", reason);
        let mut actions = Vec::new();
        self.teardown(&mut actions);
        actions.push(diagnostic(reason.clone(), MessageSeverity::Error));
        self.set_state(ConnectionState::Failed { reason }, &mut actions);
        actions
    }
}

fn diagnostic(message: String, severity: MessageSeverity) -> Action {
    Action::Emit(SessionEvent::Diagnostic(StatusMessage::new(message, severity)))
}
