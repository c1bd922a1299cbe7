//! OS signal capture
//!
//! A signal handler may only touch async-signal-safe state, so the
//! process handler does nothing but store the signal number in an
//! atomic. A pump thread polls that atomic and broadcasts hits through
//! the bridge relay. A burst of different signals can coalesce into the
//! newest one; delivery is best effort.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kestrel_bridge::SignalRelay;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

static PENDING: AtomicI32 = AtomicI32::new(0);

extern "C" fn note_signal(signo: libc::c_int) {
    PENDING.store(signo, Ordering::SeqCst);
}

/// Route `signo` into the pump: the process handler records it and the
/// pump thread broadcasts it to every context enlisted with the relay.
pub fn watch(signo: i32) {
    unsafe { libc::signal(signo, note_signal as libc::sighandler_t) };
}

/// Restore the default disposition for `signo`.
pub fn unwatch(signo: i32) {
    unsafe { libc::signal(signo, libc::SIG_DFL) };
}

/// Polling thread draining [`PENDING`] into the relay. One pump per
/// process; the handler slot is a single atomic, so a second pump would
/// steal the first one's signals.
pub struct SignalPump {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SignalPump {
    pub fn start(relay: Arc<SignalRelay>) -> SignalPump {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let worker = thread::Builder::new()
            .name("os-signal-pump".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    let signo = PENDING.swap(0, Ordering::SeqCst);
                    if signo != 0 {
                        debug!(signo, "forwarding os signal");
                        if relay.raise(signo).is_err() {
                            break;
                        }
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            })
            .expect("cannot spawn os signal pump");
        SignalPump {
            stop,
            worker: Some(worker),
        }
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SignalPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}
