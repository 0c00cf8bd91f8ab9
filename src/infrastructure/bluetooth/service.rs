//! Session Service Module
//!
//! Runs a [`SessionManager`] against a [`Transport`]: feeds it transport
//! events and consumer commands one at a time, carries out the returned
//! actions, owns the calibration timer and publishes the output streams.

use crate::domain::models::{ConnectionState, Orientation, SensorSample, SessionEvent};
use crate::infrastructure::bluetooth::session::{
    Action, SessionConfig, SessionInput, SessionManager, TimerToken,
};
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Consumer commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Begin,
    SetUpdateRate(u32),
    Calibrate,
    SaveCurrentConfig,
    RestoreDefaultConfig,
    QuitCalibration,
    Shutdown,
}

impl SessionCommand {
    /// `None` for commands handled by the run loop itself
    fn into_input(self) -> Option<SessionInput> {
        match self {
            Self::Begin => Some(SessionInput::Begin),
            Self::SetUpdateRate(hz) => Some(SessionInput::SetUpdateRate(hz)),
            Self::Calibrate => Some(SessionInput::Calibrate),
            Self::SaveCurrentConfig => Some(SessionInput::SaveCurrentConfig),
            Self::RestoreDefaultConfig => Some(SessionInput::RestoreDefaultConfig),
            Self::QuitCalibration => Some(SessionInput::QuitCalibration),
            Self::Shutdown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session service has stopped")]
pub struct SessionClosed;

/// Cloneable consumer side of a running session
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    orientation_rx: watch::Receiver<Option<Orientation>>,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<(), SessionClosed> {
        self.command_tx.send(command).map_err(|_| SessionClosed)
    }

    pub fn begin(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Begin)
    }

    /// Supported rates are 1, 2, 5, 10, 20 and 50 Hz; anything else selects 10 Hz
    pub fn set_update_rate(&self, hz: u32) -> Result<(), SessionClosed> {
        self.send(SessionCommand::SetUpdateRate(hz))
    }

    pub fn calibrate(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Calibrate)
    }

    pub fn save_current_config(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::SaveCurrentConfig)
    }

    pub fn restore_default_config(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::RestoreDefaultConfig)
    }

    pub fn quit_calibration(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::QuitCalibration)
    }

    pub fn shutdown(&self) -> Result<(), SessionClosed> {
        self.send(SessionCommand::Shutdown)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch cell following every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Most recent roll / pitch / yaw, if an inertial frame has arrived
    pub fn orientation(&self) -> Option<Orientation> {
        *self.orientation_rx.borrow()
    }
}

/// Owns the session and the transport for the lifetime of one device session
pub struct SessionService<T: Transport> {
    session: SessionManager,
    transport: T,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    timer_tx: mpsc::UnboundedSender<TimerToken>,
    timer_rx: mpsc::UnboundedReceiver<TimerToken>,
    calibration_timer: Option<(TimerToken, JoinHandle<()>)>,
    event_sender: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    orientation_tx: watch::Sender<Option<Orientation>>,
}

impl<T: Transport> SessionService<T> {
    /// Create a service, its consumer handle and the output event stream
    pub fn new(
        transport: T,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        config: SessionConfig,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (event_sender, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (orientation_tx, orientation_rx) = watch::channel(None);

        let service = Self {
            session: SessionManager::new(config),
            transport,
            transport_rx,
            command_rx,
            timer_tx,
            timer_rx,
            calibration_timer: None,
            event_sender,
            state_tx,
            orientation_tx,
        };
        let handle = SessionHandle {
            command_tx,
            state_rx,
            orientation_rx,
        };

        (service, handle, event_rx)
    }

    /// Process inputs until shutdown, all handles are dropped, or the transport closes
    pub async fn run(mut self) {
        info!("Session service started");

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command.and_then(SessionCommand::into_input) {
                        Some(input) => self.dispatch(input),
                        None => break,
                    }
                }
                event = self.transport_rx.recv() => match event {
                    Some(event) => self.dispatch(SessionInput::Transport(event)),
                    None => {
                        warn!("Transport event stream closed");
                        self.dispatch(SessionInput::Transport(TransportEvent::Disconnected {
                            reason: Some("transport closed".to_string()),
                        }));
                        break;
                    }
                },
                Some(token) = self.timer_rx.recv() => {
                    self.dispatch(SessionInput::CalibrationDeadline(token));
                }
            }
        }

        self.abort_calibration_timer();
        info!("Session service stopped");
    }

    /// Feed one input and execute the resulting actions
    ///
    /// Transport request failures are turned back into inputs and handled
    /// after the current batch.
    fn dispatch(&mut self, input: SessionInput) {
        let mut pending = VecDeque::from([input]);
        while let Some(input) = pending.pop_front() {
            for action in self.session.handle(input) {
                if let Some(feedback) = self.execute(action) {
                    pending.push_back(SessionInput::Transport(feedback));
                }
            }
        }
    }

    fn execute(&mut self, action: Action) -> Option<TransportEvent> {
        match action {
            Action::StartScan {
                service,
                allow_duplicates,
            } => self
                .transport
                .start_scan(service, allow_duplicates)
                .err()
                .map(|e| TransportEvent::ScanFailed {
                    reason: e.detail(),
                }),
            Action::StopScan => {
                if let Err(e) = self.transport.stop_scan() {
                    warn!("Failed to stop scan: {}", e);
                }
                None
            }
            Action::Connect(id) => {
                self.transport
                    .connect(&id)
                    .err()
                    .map(|e| TransportEvent::ConnectFailed {
                        id,
                        reason: e.detail(),
                    })
            }
            Action::DiscoverServices {
                peripheral,
                services,
            } => self
                .transport
                .discover_services(&peripheral, &services)
                .err()
                .map(|e| TransportEvent::DiscoveryFailed {
                    reason: e.detail(),
                }),
            Action::DiscoverCharacteristics {
                peripheral,
                service,
                characteristics,
            } => self
                .transport
                .discover_characteristics(&peripheral, service, &characteristics)
                .err()
                .map(|e| TransportEvent::DiscoveryFailed {
                    reason: e.detail(),
                }),
            Action::SetNotify {
                characteristic,
                enabled,
            } => {
                // Some stacks push telemetry without an explicit subscription
                if let Err(e) = self.transport.set_notify(characteristic, enabled) {
                    warn!("Could not enable notifications on {}: {}", characteristic, e);
                }
                None
            }
            Action::Write {
                characteristic,
                command,
            } => {
                let frame = command.encode();
                debug!("Writing {:?} {:02X?} to {}", command, frame, characteristic);
                self.transport
                    .write(characteristic, &frame, true)
                    .err()
                    .map(|e| TransportEvent::WriteCompleted {
                        characteristic,
                        result: Err(e.detail()),
                    })
            }
            Action::ArmCalibrationTimer { token, delay } => {
                self.abort_calibration_timer();
                let timer_tx = self.timer_tx.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = timer_tx.send(token);
                });
                self.calibration_timer = Some((token, task));
                None
            }
            Action::CancelCalibrationTimer { token } => {
                if matches!(&self.calibration_timer, Some((armed, _)) if *armed == token) {
                    self.abort_calibration_timer();
                }
                None
            }
            Action::Emit(event) => {
                self.publish(event);
                None
            }
        }
    }

    fn publish(&mut self, event: SessionEvent) {
        match &event {
            SessionEvent::StateChanged(state) => {
                self.state_tx.send_replace(state.clone());
            }
            SessionEvent::Sample(SensorSample::Inertial(sample)) => {
                self.orientation_tx.send_replace(Some(Orientation::from(sample)));
            }
            _ => {}
        }
        let _ = self.event_sender.send(event);
    }

    fn abort_calibration_timer(&mut self) {
        if let Some((token, task)) = self.calibration_timer.take() {
            debug!("Cancelling calibration timer {:?}", token);
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::MessageSeverity;
    use crate::infrastructure::bluetooth::protocol::{self, Command};
    use crate::infrastructure::bluetooth::transport::{
        Advertisement, CharacteristicId, CharacteristicInfo, PeripheralId, TransportError,
    };
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use uuid::Uuid;

    const NOTIFY: CharacteristicId = CharacteristicId(1);
    const WRITE: CharacteristicId = CharacteristicId(2);

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        StartScan(Uuid, bool),
        StopScan,
        Connect(PeripheralId),
        DiscoverServices,
        DiscoverCharacteristics,
        SetNotify(CharacteristicId, bool),
        Write(CharacteristicId, Vec<u8>, bool),
    }

    #[derive(Clone, Default)]
    struct RecordingTransport {
        calls: Arc<Mutex<Vec<Call>>>,
        refuse_scan: bool,
        refuse_connect: bool,
        refuse_writes: bool,
    }

    impl RecordingTransport {
        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn writes(&self) -> Vec<Vec<u8>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| match c {
                    Call::Write(_, bytes, _) => Some(bytes.clone()),
                    _ => None,
                })
                .collect()
        }

        fn count_writes(&self, command: Command) -> usize {
            let frame = command.encode().to_vec();
            self.writes().iter().filter(|w| **w == frame).count()
        }
    }

    impl Transport for RecordingTransport {
        fn start_scan(
            &mut self,
            service: Uuid,
            allow_duplicates: bool,
        ) -> Result<(), TransportError> {
            if self.refuse_scan {
                return Err(TransportError::Scan("no adapter".to_string()));
            }
            self.record(Call::StartScan(service, allow_duplicates));
            Ok(())
        }

        fn stop_scan(&mut self) -> Result<(), TransportError> {
            self.record(Call::StopScan);
            Ok(())
        }

        fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
            if self.refuse_connect {
                return Err(TransportError::Connect("adapter busy".to_string()));
            }
            self.record(Call::Connect(peripheral.clone()));
            Ok(())
        }

        fn discover_services(
            &mut self,
            _peripheral: &PeripheralId,
            _services: &[Uuid],
        ) -> Result<(), TransportError> {
            self.record(Call::DiscoverServices);
            Ok(())
        }

        fn discover_characteristics(
            &mut self,
            _peripheral: &PeripheralId,
            _service: Uuid,
            _characteristics: &[Uuid],
        ) -> Result<(), TransportError> {
            self.record(Call::DiscoverCharacteristics);
            Ok(())
        }

        fn set_notify(
            &mut self,
            characteristic: CharacteristicId,
            enabled: bool,
        ) -> Result<(), TransportError> {
            self.record(Call::SetNotify(characteristic, enabled));
            Ok(())
        }

        fn write(
            &mut self,
            characteristic: CharacteristicId,
            value: &[u8],
            with_response: bool,
        ) -> Result<(), TransportError> {
            if self.refuse_writes {
                return Err(TransportError::Write("gatt busy".to_string()));
            }
            self.record(Call::Write(characteristic, value.to_vec(), with_response));
            Ok(())
        }
    }

    struct Harness {
        transport: RecordingTransport,
        transport_tx: mpsc::UnboundedSender<TransportEvent>,
        handle: SessionHandle,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        task: JoinHandle<()>,
    }

    fn start(transport: RecordingTransport) -> Harness {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (service, handle, events) =
            SessionService::new(transport.clone(), transport_rx, SessionConfig::default());
        let task = tokio::spawn(service.run());
        Harness {
            transport,
            transport_tx,
            handle,
            events,
            task,
        }
    }

    impl Harness {
        fn deliver(&self, event: TransportEvent) {
            self.transport_tx.send(event).unwrap();
        }

        async fn wait_for(&mut self, wanted: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
            tokio::time::timeout(Duration::from_secs(30), async {
                loop {
                    let event = self.events.recv().await.expect("event stream closed");
                    if wanted(&event) {
                        return event;
                    }
                }
            })
            .await
            .expect("timed out waiting for event")
        }

        async fn begin(&mut self) {
            self.handle.begin().unwrap();
            self.wait_for(|e| *e == SessionEvent::StateChanged(ConnectionState::Scanning))
                .await;
        }

        async fn connect(&mut self) {
            self.begin().await;
            self.deliver(TransportEvent::Advertisement(Advertisement {
                name: Some("WT901BLE68".to_string()),
                id: PeripheralId::from("imu"),
                rssi: -48,
            }));
            self.deliver(TransportEvent::Connected(PeripheralId::from("imu")));
            self.deliver(TransportEvent::ServicesDiscovered(vec![protocol::SERVICE_UUID]));
            self.deliver(TransportEvent::CharacteristicsDiscovered {
                service: protocol::SERVICE_UUID,
                characteristics: vec![
                    CharacteristicInfo {
                        uuid: protocol::NOTIFY_CHAR_UUID,
                        id: NOTIFY,
                    },
                    CharacteristicInfo {
                        uuid: protocol::WRITE_CHAR_UUID,
                        id: WRITE,
                    },
                ],
            });
            self.wait_for(|e| *e == SessionEvent::StateChanged(ConnectionState::Ready))
                .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sequence() {
        let mut h = start(RecordingTransport::default());
        h.connect().await;

        let calls = h.transport.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                Call::StartScan(protocol::SERVICE_UUID, true),
                Call::StopScan,
                Call::Connect(PeripheralId::from("imu")),
                Call::DiscoverServices,
                Call::DiscoverCharacteristics,
                Call::SetNotify(NOTIFY, true),
                Call::Write(WRITE, vec![0xFF, 0xAA, 0x03, 0x03, 0x00], true),
            ]
        );
        assert_eq!(h.handle.connection_state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_updates_orientation() {
        let mut h = start(RecordingTransport::default());
        h.connect().await;
        assert_eq!(h.handle.orientation(), None);

        let mut frame = vec![0u8; 20];
        frame[..2].copy_from_slice(&[0x55, 0x61]);
        frame[16..18].copy_from_slice(&16384i16.to_le_bytes());
        h.deliver(TransportEvent::Notification {
            characteristic: NOTIFY,
            value: frame,
        });
        h.wait_for(|e| matches!(e, SessionEvent::Sample(_))).await;

        let orientation = h.handle.orientation().unwrap();
        assert!((orientation.pitch - 90.0).abs() < 1e-9);
        assert_eq!(
            h.transport.writes().last().unwrap(),
            &vec![0xFF, 0xAA, 0x27, 0x3a, 0x00]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_calibrate_saves_once() {
        let mut h = start(RecordingTransport::default());
        h.connect().await;

        h.handle.calibrate().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.handle.calibrate().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.transport.count_writes(Command::CalibrateMagnetometer), 1);
        assert_eq!(h.transport.count_writes(Command::CalibrateAccelerometer), 1);
        assert_eq!(h.transport.count_writes(Command::SaveConfig), 1);

        let writes = h.transport.writes();
        let n = writes.len();
        assert_eq!(
            &writes[n - 3..],
            &[
                Command::CalibrateMagnetometer.encode().to_vec(),
                Command::CalibrateAccelerometer.encode().to_vec(),
                Command::SaveConfig.encode().to_vec(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_saves_after_window() {
        let mut h = start(RecordingTransport::default());
        h.connect().await;

        h.handle.calibrate().unwrap();
        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(h.transport.count_writes(Command::SaveConfig), 0);

        h.wait_for(|e| *e == SessionEvent::CalibrationFinished { saved: true })
            .await;
        assert_eq!(h.transport.count_writes(Command::SaveConfig), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_calibration_skips_save() {
        let mut h = start(RecordingTransport::default());
        h.connect().await;

        h.handle.calibrate().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.deliver(TransportEvent::Disconnected {
            reason: Some("link loss".to_string()),
        });
        h.wait_for(|e| matches!(e, SessionEvent::ConnectionLost { .. }))
            .await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.transport.count_writes(Command::SaveConfig), 0);
        assert_eq!(
            h.handle.connection_state(),
            ConnectionState::Disconnected {
                reason: "link loss".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_fails_session() {
        let transport = RecordingTransport {
            refuse_connect: true,
            ..Default::default()
        };
        let mut h = start(transport);
        h.begin().await;
        h.deliver(TransportEvent::Advertisement(Advertisement {
            name: Some("WT901BLE68".to_string()),
            id: PeripheralId::from("imu"),
            rssi: -70,
        }));

        let event = h
            .wait_for(|e| matches!(e, SessionEvent::StateChanged(ConnectionState::Failed { .. })))
            .await;
        assert_eq!(
            event,
            SessionEvent::StateChanged(ConnectionState::Failed {
                reason: "connect failed: adapter busy".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_scan_fails_session() {
        let transport = RecordingTransport {
            refuse_scan: true,
            ..Default::default()
        };
        let mut h = start(transport);
        h.handle.begin().unwrap();

        h.wait_for(|e| {
            *e == SessionEvent::StateChanged(ConnectionState::Failed {
                reason: "scan failed: no adapter".to_string(),
            })
        })
        .await;
        assert!(h.transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_write_reports_diagnostic() {
        let transport = RecordingTransport {
            refuse_writes: true,
            ..Default::default()
        };
        let mut h = start(transport);
        h.connect().await;

        let event = h.wait_for(|e| matches!(e, SessionEvent::Diagnostic(_))).await;
        let SessionEvent::Diagnostic(message) = event else {
            unreachable!()
        };
        assert_eq!(message.severity, MessageSeverity::Error);
        assert_eq!(message.message, "Write to #2 failed: gatt busy");
        assert_eq!(h.handle.connection_state(), ConnectionState::Ready);
        assert!(h.transport.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_service() {
        let h = start(RecordingTransport::default());
        h.handle.shutdown().unwrap();
        h.task.await.unwrap();
        assert_eq!(h.handle.begin(), Err(SessionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_close_reports_disconnect() {
        let mut h = start(RecordingTransport::default());
        h.connect().await;

        let Harness {
            transport_tx,
            mut events,
            task,
            handle: _handle,
            ..
        } = h;
        drop(transport_tx);
        task.await.unwrap();

        let mut lost = false;
        while let Ok(event) = events.try_recv() {
            lost |= matches!(event, SessionEvent::ConnectionLost { .. });
        }
        assert!(lost);
    }
}
