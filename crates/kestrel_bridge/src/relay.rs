//! Signal relay
//!
//! One worker thread owns the registry of signal-interested contexts, so
//! OS signal handlers (or anyone else) can fan a signal out to every
//! enlisted context without taking locks in the delivery path. Contexts
//! are held weakly: a context that died since enlisting is pruned on the
//! next broadcast, and one that closed but still has wrappers is skipped
//! by its own closed check.
//!
//! Shutdown is a sentinel message; the worker drains its registry and
//! exits, and `shutdown` joins it so callers observe a quiet relay.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::context::{Context, ContextShared};
use crate::error::{BridgeError, Result};

enum RelayMsg {
    Enlist(Weak<ContextShared>),
    Raise(i32),
    Shutdown,
}

/// Broadcast fan-out of raised signals to enlisted contexts.
pub struct SignalRelay {
    tx: Sender<RelayMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SignalRelay {
    pub fn spawn() -> SignalRelay {
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("signal-relay".into())
            .spawn(move || {
                let mut bag: Vec<Weak<ContextShared>> = Vec::new();
                loop {
                    match rx.recv() {
                        Ok(RelayMsg::Enlist(context)) => {
                            bag.push(context);
                            trace!(enlisted = bag.len(), "relay enlist");
                        }
                        Ok(RelayMsg::Raise(signo)) => {
                            let before = bag.len();
                            bag.retain(|weak| match weak.upgrade() {
                                Some(context) => {
                                    context.raise(signo);
                                    true
                                }
                                None => false,
                            });
                            trace!(
                                signo,
                                delivered = bag.len(),
                                pruned = before - bag.len(),
                                "relay raise"
                            );
                        }
                        Ok(RelayMsg::Shutdown) | Err(_) => break,
                    }
                }
                bag.clear();
                debug!("relay drained");
            })
            .expect("cannot spawn signal relay");
        SignalRelay {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Add `context` to the broadcast registry.
    pub fn enlist(&self, context: &Context) -> Result<()> {
        self.tx
            .send(RelayMsg::Enlist(Arc::downgrade(&context.shared)))
            .map_err(|_| BridgeError::RelayDown)
    }

    /// Fan `signo` out to every enlisted context still alive.
    pub fn raise(&self, signo: i32) -> Result<()> {
        self.tx
            .send(RelayMsg::Raise(signo))
            .map_err(|_| BridgeError::RelayDown)
    }

    /// Stop the worker and wait for it to drain. Safe to call more than
    /// once; enlist and raise fail with `RelayDown` afterwards.
    pub fn shutdown(&self) {
        let _ = self.tx.send(RelayMsg::Shutdown);
        // The lock is held across the join so a second caller waits for
        // the drain instead of returning to a still-running worker.
        let mut slot = self.worker.lock().unwrap();
        if let Some(worker) = slot.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}
