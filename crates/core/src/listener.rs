//! Primary-side accept loop
//!
//! Connections are served one at a time on a dedicated thread, so activations
//! reach the sink in the order their connections were accepted.

use crate::bridge::NotificationBridge;
use crate::config::GuardConfig;
use crate::error::{InstanceError, Result};
use crate::ipc::{
    interrupt_blocking_io, read_message, ConnectionAbort, PipeClient, PipeServer,
};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for the accept loop to exit
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between the handle and the accept loop
#[derive(Default)]
struct LoopState {
    stop: AtomicBool,
    /// Connection currently being read, if it can be aborted
    active: Mutex<Option<ConnectionAbort>>,
}

/// Running accept loop. Dropping the handle stops it.
pub struct ListenerHandle {
    config: GuardConfig,
    state: Arc<LoopState>,
    thread: Option<JoinHandle<()>>,
}

/// Bind the activation endpoint on the caller's thread, then serve it on a
/// background thread
pub fn start_listening(
    config: &GuardConfig,
    bridge: Arc<NotificationBridge>,
) -> Result<ListenerHandle> {
    let server = PipeServer::bind(config).map_err(|source| InstanceError::ListenerBindFailed {
        endpoint: config.endpoint_path().display().to_string(),
        source,
    })?;

    info!(
        "Activation endpoint listening: {}",
        config.endpoint_path().display()
    );

    let state = Arc::new(LoopState::default());
    let loop_state = Arc::clone(&state);
    let thread = thread::Builder::new()
        .name("instance-listener".to_string())
        .spawn(move || run_accept_loop(server, bridge, loop_state))?;

    Ok(ListenerHandle {
        config: config.clone(),
        state,
        thread: Some(thread),
    })
}

fn run_accept_loop(
    mut server: PipeServer,
    bridge: Arc<NotificationBridge>,
    state: Arc<LoopState>,
) {
    while !state.stop.load(Ordering::SeqCst) {
        let mut connection = match server.accept() {
            Ok(connection) => connection,
            Err(e) => {
                if state.stop.load(Ordering::SeqCst) {
                    break;
                }
                error!("Accepting activation connection failed: {}", e);
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        // Publish the abort handle before checking the flag; shutdown sets
        // the flag before taking the handle, so one of the two sees the other
        *state.active.lock() = connection.abort_handle();
        if state.stop.load(Ordering::SeqCst) {
            break;
        }

        match read_message(&mut connection) {
            Ok(message) => {
                bridge.send_event(message);
            }
            Err(InstanceError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Secondary disconnected before sending a full message");
            }
            Err(e) => {
                warn!("Discarding activation message: {}", e);
            }
        }

        state.active.lock().take();
    }

    info!("Activation listener stopped");
}

impl ListenerHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the accept loop and wait up to [`SHUTDOWN_TIMEOUT`] for the thread
    /// to exit.
    ///
    /// Returns false if the thread is still running; it then keeps the
    /// endpoint until it exits on its own.
    pub fn shutdown(&mut self) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };

        if !self.state.stop.swap(true, Ordering::SeqCst) {
            // Abort a read blocked on a connected client
            if let Some(active) = self.state.active.lock().take() {
                active.abort();
            }
            interrupt_blocking_io(&thread);

            // Unblock the pending accept with a connection of our own
            if let Err(e) = PipeClient::connect(&self.config) {
                debug!("Wake-up connection failed ({})", e);
            }
        }

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!("Activation listener did not stop within {:?}", SHUTDOWN_TIMEOUT);
                self.thread = Some(thread);
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }

        if thread.join().is_err() {
            error!("Activation listener thread panicked");
        }
        true
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        // A second attempt after a timed-out shutdown would only wait again
        if !self.state.stop.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}
