//! Notification bridge between the listener thread and the application
//!
//! The application registers at most one [`EventSink`]; the listener pushes
//! every received [`ActivationMessage`] into it. With no sink registered the
//! message is dropped.

use crate::error::{InstanceError, Result};
use crate::ipc::ActivationMessage;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Receives forwarded activations on the listener thread.
///
/// Runs under the bridge lock; a sink must not call back into the bridge.
pub trait EventSink: Send {
    fn success(&mut self, message: ActivationMessage);
}

impl EventSink for Sender<ActivationMessage> {
    fn success(&mut self, message: ActivationMessage) {
        if self.send(message).is_err() {
            warn!("Activation receiver was dropped; message discarded");
        }
    }
}

/// Adapts a closure into an [`EventSink`]
pub struct CallbackSink<F>(pub F);

impl<F> EventSink for CallbackSink<F>
where
    F: FnMut(ActivationMessage) + Send,
{
    fn success(&mut self, message: ActivationMessage) {
        (self.0)(message)
    }
}

/// Single-subscriber slot shared by the registration side and the listener
#[derive(Default)]
pub struct NotificationBridge {
    sink: Mutex<Option<Box<dyn EventSink>>>,
    dropped: AtomicU64,
}

impl NotificationBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the active sink. A second registration is rejected and the
    /// existing sink stays in place.
    pub fn on_listen(
        &self,
        args: Option<&serde_json::Value>,
        sink: Box<dyn EventSink>,
    ) -> Result<()> {
        let mut slot = self.sink.lock();
        if slot.is_some() {
            warn!("Rejected duplicate activation listener");
            return Err(InstanceError::DuplicateListenerRegistration);
        }

        *slot = Some(sink);
        info!("Activation listener registered (args: {:?})", args);
        Ok(())
    }

    /// Deregister the active sink; later messages are dropped until a new
    /// sink registers
    pub fn on_cancel(&self, args: Option<&serde_json::Value>) -> Result<()> {
        match self.sink.lock().take() {
            Some(_) => {
                info!("Activation listener cancelled (args: {:?})", args);
                Ok(())
            }
            None => Err(InstanceError::ListenerNotRegistered),
        }
    }

    /// Push one message to the registered sink.
    ///
    /// Returns whether a sink received it.
    pub fn send_event(&self, message: ActivationMessage) -> bool {
        let mut slot = self.sink.lock();
        match slot.as_mut() {
            Some(sink) => {
                debug!("Delivering activation: {:?}", message.args);
                sink.success(message);
                true
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("No activation listener; dropped {:?}", message.args);
                false
            }
        }
    }

    /// Messages discarded because no sink was registered
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_listening(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Register a channel-backed sink and hand back its receiving end
    pub fn subscribe(&self) -> Result<Receiver<ActivationMessage>> {
        let (tx, rx) = channel::unbounded();
        self.on_listen(None, Box::new(tx))?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn message(args: &[&str]) -> ActivationMessage {
        ActivationMessage::new(args.iter().copied())
    }

    #[test]
    fn test_starts_unregistered() {
        let bridge = NotificationBridge::new();
        assert!(!bridge.is_listening());
        assert!(!bridge.send_event(message(&["--file", "a.txt"])));
        assert_eq!(bridge.dropped_count(), 1);
    }

    #[test]
    fn test_registered_sink_receives_events() {
        let bridge = NotificationBridge::new();
        let rx = bridge.subscribe().unwrap();

        assert!(bridge.send_event(message(&["--file", "b.txt"])));
        assert_eq!(rx.try_recv().unwrap().args, vec!["--file", "b.txt"]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_registration_keeps_existing_sink() {
        let bridge = NotificationBridge::new();
        let first = bridge.subscribe().unwrap();

        let (tx, second) = channel::unbounded();
        let err = bridge.on_listen(None, Box::new(tx)).unwrap_err();
        assert!(matches!(err, InstanceError::DuplicateListenerRegistration));

        bridge.send_event(message(&["one"]));
        assert_eq!(first.try_recv().unwrap().args, vec!["one"]);
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn test_cancel_drops_later_events() {
        let bridge = NotificationBridge::new();
        let rx = bridge.subscribe().unwrap();

        bridge.on_cancel(None).unwrap();
        assert!(!bridge.is_listening());
        assert!(!bridge.send_event(message(&["late"])));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_without_listener_is_error() {
        let bridge = NotificationBridge::new();
        let err = bridge.on_cancel(None).unwrap_err();
        assert!(matches!(err, InstanceError::ListenerNotRegistered));
    }

    #[test]
    fn test_listen_again_after_cancel() {
        let bridge = NotificationBridge::new();
        let _old = bridge.subscribe().unwrap();
        bridge.on_cancel(None).unwrap();

        let new = bridge.subscribe().unwrap();
        bridge.send_event(message(&["again"]));
        assert_eq!(new.try_recv().unwrap().args, vec!["again"]);
    }

    #[test]
    fn test_callback_sink() {
        let bridge = NotificationBridge::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);

        let args = serde_json::json!({ "channel": "activation" });
        bridge
            .on_listen(
                Some(&args),
                Box::new(CallbackSink(move |m: ActivationMessage| {
                    sink_seen.lock().push(m.args)
                })),
            )
            .unwrap();

        bridge.send_event(message(&["a"]));
        bridge.send_event(message(&["b"]));
        assert_eq!(*seen.lock(), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_dropped_receiver_does_not_fail_delivery() {
        let bridge = NotificationBridge::new();
        drop(bridge.subscribe().unwrap());
        assert!(bridge.send_event(message(&["orphan"])));
    }
}
