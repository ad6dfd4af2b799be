//! Diagnostic session timeout
//!
//! Programming and Extended sessions fall back to the default session when
//! the tester goes quiet. The timer is armed when such a session starts,
//! touched on every matched response and checked by a small background task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::model::{EcuModel, UdsSession};

/// S3-style server timeout before a non-default session expires.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SessionTimer {
    timeout: Duration,
    deadline: Mutex<Option<Instant>>,
}

impl SessionTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Mutex::new(None),
        }
    }

    /// Start (or restart) the countdown.
    pub fn arm(&self) {
        *self.deadline.lock() = Some(Instant::now() + self.timeout);
    }

    /// Push the deadline out if the countdown is running.
    pub fn touch(&self) {
        let mut deadline = self.deadline.lock();
        if deadline.is_some() {
            *deadline = Some(Instant::now() + self.timeout);
        }
    }

    pub fn disarm(&self) {
        *self.deadline.lock() = None;
    }

    pub fn expired(&self) -> bool {
        self.deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Watch the timer and drop the ECU back into the default session on expiry.
pub fn spawn_expiry_task(
    timer: Arc<SessionTimer>,
    model: Arc<EcuModel>,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(200));
        while running.load(Ordering::SeqCst) {
            interval.tick().await;
            if timer.expired() {
                timer.disarm();
                model.set_session(UdsSession::Default);
                debug!(ecu = model.ident(), "diagnostic session timed out");
            }
        }
    })
}
