//! WT901BLECL IMU session core
//!
//! Discovers and connects to a WitMotion WT901BLECL over a caller-supplied BLE
//! transport, decodes its telemetry and keeps the inertial → magnetic →
//! quaternion → temperature polling cycle running.
//!
//! ```no_run
//! use tokio::sync::mpsc;
//! use wt901_ble::domain::models::SessionEvent;
//! use wt901_ble::domain::settings::SettingsService;
//! use wt901_ble::infrastructure::bluetooth::transport::{Transport, TransportEvent};
//! use wt901_ble::infrastructure::bluetooth::{SessionConfig, SessionService};
//!
//! async fn run<T: Transport + Send + 'static>(
//!     transport: T,
//!     transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
//! ) -> anyhow::Result<()> {
//!     let settings = SettingsService::new()?;
//!     let _guard = wt901_ble::infrastructure::logging::init_logger(&settings.get().log_settings)?;
//!     let config = SessionConfig::from_settings(settings.get())?;
//!
//!     let (service, handle, mut events) = SessionService::new(transport, transport_rx, config);
//!     tokio::spawn(service.run());
//!     handle.begin()?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::Sample(sample) => println!("{}", sample),
//!             SessionEvent::ConnectionLost { .. } => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod domain;
pub mod infrastructure;
