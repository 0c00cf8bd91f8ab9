//! Bluetooth Module
//!
//! Session handling for the WT901BLECL IMU over an external BLE transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SessionService                        │
//! │  (async runner - public API for the application)         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │ Transport │  │  Session   │  │ Protocol  │
//! │           │  │            │  │           │
//! │ - scan    │  │ - states   │  │ - UUIDs   │
//! │ - GATT    │  │ - polling  │  │ - Commands│
//! │   (trait) │  │ - calib.   │  │ - Decoding│
//! └───────────┘  └────────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers, command encoding and telemetry decoding
//! - [`transport`] - Radio abstraction implemented by the embedding application
//! - [`session`] - Connection state machine
//! - [`service`] - Async runner and consumer handle

pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;

pub use service::{SessionHandle, SessionService};
pub use session::{SessionConfig, SessionManager};
