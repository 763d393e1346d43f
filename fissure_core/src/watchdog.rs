use crate::publisher::Interrupter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{trace, warn};

/// Bounds the wall time of one action.
///
/// Arming starts a thread that waits for `limit`. If the watchdog is not
/// disarmed in time the thread marks it expired and calls the interrupter, if
/// any. Dropping the watchdog cancels and joins the thread.
pub struct Watchdog {
    cancel: Option<Sender<()>>,
    expired: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn arm(limit: Duration, interrupter: Option<Interrupter>) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let expired = Arc::new(AtomicBool::new(false));
        let flag = expired.clone();
        let thread = std::thread::spawn(move || match cancelled.recv_timeout(limit) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(?limit, "watchdog expired");
                flag.store(true, Ordering::SeqCst);
                if let Some(interrupt) = interrupter {
                    interrupt();
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => trace!("watchdog cancelled"),
        });
        Self {
            cancel: Some(cancel),
            expired,
            thread: Some(thread),
        }
    }

    pub fn has_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Cancels the watchdog and returns whether it had already expired.
    pub fn disarm(mut self) -> bool {
        self.stop();
        self.has_expired()
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn disarmed_in_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let interrupter: Interrupter = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let watchdog = Watchdog::arm(Duration::from_secs(10), Some(interrupter));
        let start = Instant::now();
        assert!(!watchdog.disarm());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn expiry_calls_interrupter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let interrupter: Interrupter = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let watchdog = Watchdog::arm(Duration::from_millis(20), Some(interrupter));
        std::thread::sleep(Duration::from_millis(200));
        assert!(watchdog.has_expired());
        assert!(watchdog.disarm());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_cancels() {
        let watchdog = Watchdog::arm(Duration::from_secs(30), None);
        let start = Instant::now();
        drop(watchdog);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
