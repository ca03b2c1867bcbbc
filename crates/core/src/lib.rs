//! Instance Guard Core Library
//!
//! Keeps an application to one running process and forwards the launch
//! arguments of later starts to it.
//!
//! Architecture:
//! - The first launch takes the instance lock (lock module) and becomes primary
//! - The primary serves an activation endpoint on a background thread (listener module)
//! - Later launches become secondaries and forward their arguments (ipc module)
//! - Received activations are pushed to one registered sink (bridge module)
//! - `SingleInstance` (service module) ties these together for the startup routine

pub mod bridge;
pub mod config;
pub mod error;
pub mod ipc;
pub mod listener;
pub mod lock;
pub mod service;

pub use bridge::{CallbackSink, EventSink, NotificationBridge};
pub use config::GuardConfig;
pub use error::{InstanceError, Result};
pub use ipc::ActivationMessage;
pub use lock::{LockHandle, Role};
pub use service::{startup, SingleInstance, Startup};
