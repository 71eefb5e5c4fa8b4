//! Supervise a single background daemon through the platform service
//! manager: observe whether it runs, start and stop it behind an
//! authorization gate, and toggle whether it starts at boot.

pub mod auth;
pub mod clock;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod error;
pub mod inspector;
pub mod lifecycle;
pub mod monitor;
pub mod observer;
pub mod state_machine;

pub use control::{AutoStartFlag, ManagerKind, ServiceAdapter};
pub use descriptor::{ServiceDescriptor, SignaturePattern};
pub use error::{AuthError, ControlError, ServiceError};
pub use lifecycle::{CancelToken, LifecycleController, Timing};
pub use observer::{StatusEvent, StatusObserver};
pub use state_machine::ServiceState;
