//! Single-instance service object
//!
//! Owns the lock, the listener and the notification bridge for one process,
//! and is handed to the application's startup routine instead of living in
//! global state.

use crate::bridge::{EventSink, NotificationBridge};
use crate::config::GuardConfig;
use crate::error::{InstanceError, Result};
use crate::ipc::{self, ActivationMessage};
use crate::listener::{self, ListenerHandle};
use crate::lock::{self, LockHandle, Role};
use crossbeam::channel::Receiver;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SingleInstance {
    config: GuardConfig,
    role: Role,
    lock: Option<LockHandle>,
    listener: Option<ListenerHandle>,
    bridge: Arc<NotificationBridge>,
}

/// Outcome of [`startup`]
pub enum Startup {
    /// This process owns the lock and keeps running
    Primary(SingleInstance),
    /// Another process is primary; the caller must exit
    Secondary { forwarded: bool },
}

impl SingleInstance {
    /// Validate the configuration and decide this process's role
    pub fn create(config: GuardConfig) -> Result<Self> {
        config.validate()?;
        let (role, lock) = lock::acquire_or_detect(&config)?;

        Ok(Self {
            config,
            role,
            lock,
            listener: None,
            bridge: Arc::new(NotificationBridge::new()),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Arc<NotificationBridge> {
        &self.bridge
    }

    fn require(&self, expected: Role) -> Result<()> {
        if self.role == expected {
            Ok(())
        } else {
            Err(InstanceError::WrongRole {
                expected,
                actual: self.role,
            })
        }
    }

    /// Open the activation endpoint and serve it in the background
    pub fn start_listening(&mut self) -> Result<()> {
        self.require(Role::Primary)?;
        if self.listener.is_some() {
            return Err(InstanceError::ListenerAlreadyStarted);
        }

        self.listener = Some(listener::start_listening(
            &self.config,
            Arc::clone(&self.bridge),
        )?);
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(ListenerHandle::is_running)
    }

    /// Send this launch's arguments to the primary
    pub fn forward_arguments<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require(Role::Secondary)?;
        ipc::forward_arguments(&self.config, args)
    }

    pub fn listen(
        &self,
        args: Option<&serde_json::Value>,
        sink: Box<dyn EventSink>,
    ) -> Result<()> {
        self.bridge.on_listen(args, sink)
    }

    pub fn cancel(&self, args: Option<&serde_json::Value>) -> Result<()> {
        self.bridge.on_cancel(args)
    }

    pub fn subscribe(&self) -> Result<Receiver<ActivationMessage>> {
        self.bridge.subscribe()
    }

    /// Stop listening, drop the sink and release the lock
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let stopped = match self.listener.take() {
            Some(mut listener) => listener.shutdown(),
            None => true,
        };
        let _ = self.bridge.on_cancel(None);

        let Some(lock) = self.lock.take() else {
            return;
        };
        if stopped {
            lock.release();
            info!("Single-instance service for `{}` shut down", self.config.app_id);
        } else {
            // The listener still owns the endpoint; a new primary must not
            // bind it while that thread is alive
            warn!("Activation listener still running; keeping the instance lock");
            lock.retain_until_exit();
        }
    }
}

impl Drop for SingleInstance {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Startup routine: become primary and listen, or forward `args` to the
/// running primary.
///
/// Only [`InstanceError::LockCreationFailed`] (and invalid configuration) is
/// returned as an error. A primary that cannot bind its endpoint keeps
/// running without forwarded activations; a secondary that cannot connect
/// still reports `Secondary` so the caller exits.
pub fn startup<I, S>(config: GuardConfig, args: I) -> Result<Startup>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut instance = SingleInstance::create(config)?;

    match instance.role() {
        Role::Primary => {
            if let Err(e) = instance.start_listening() {
                warn!("Running without activation forwarding: {}", e);
            }
            Ok(Startup::Primary(instance))
        }
        Role::Secondary => {
            let forwarded = match instance.forward_arguments(args) {
                Ok(()) => {
                    info!("Forwarded activation to the running instance");
                    true
                }
                Err(e) => {
                    warn!("Could not forward activation: {}", e);
                    false
                }
            };
            Ok(Startup::Secondary { forwarded })
        }
    }
}
