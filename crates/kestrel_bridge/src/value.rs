//! Value host object
//!
//! A [`Value`] wraps one native value cell and owns exactly one of its
//! reference units: the unit transferred by whichever native operation
//! returned the handle. Binding chains the value under its context;
//! closing releases the unit and splices it out. A value the host never
//! closes is closed by the context's teardown cascade, so the unit can
//! not outlive the heap it counts against.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kestrel_api::{EngineCalls, FieldCursor, FieldKey, RawContext, RawValue, ValueTag};
use tracing::trace;

use crate::chain::Membership;
use crate::context::ContextShared;
use crate::error::{BridgeError, Result};

pub(crate) struct ValueShared {
    calls: Arc<dyn EngineCalls>,
    pub(crate) context: RawContext,
    pub(crate) handle: RawValue,
    closed: AtomicBool,
    close_gate: Mutex<()>,
    membership: Mutex<Option<Membership<ContextShared>>>,
}

impl ValueShared {
    /// Release the owned reference unit and splice out of the context
    /// chain. Runs at most once; the context cascade, an explicit close
    /// and the drop of the last wrapper all funnel through here.
    pub(crate) fn teardown(&self) {
        let _gate = self.close_gate.lock().unwrap();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.calls.value_ref_down(self.context, self.handle);
        let membership = self.membership.lock().unwrap().take();
        if let Some(m) = membership {
            if let Some(context) = m.parent.upgrade() {
                context.values.lock().unwrap().splice(m.node);
            }
        }
        trace!(value = self.handle.to_bits(), "value released");
    }
}

impl Drop for ValueShared {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Handle to one native value, alive until closed or until its context
/// closes it.
#[derive(Clone)]
pub struct Value {
    shared: Arc<ValueShared>,
}

impl Value {
    /// Adopt a native handle whose reference unit was transferred to us,
    /// chaining it under `context`. On a context that is already closing,
    /// the unit is abandoned to the dying heap and `Closed` is returned.
    pub(crate) fn bind(context: &Arc<ContextShared>, raw: RawValue) -> Result<Value> {
        let shared = Arc::new(ValueShared {
            calls: context.calls.clone(),
            context: context.handle,
            handle: raw,
            closed: AtomicBool::new(false),
            close_gate: Mutex::new(()),
            membership: Mutex::new(None),
        });
        {
            let mut chain = context.values.lock().unwrap();
            if context.closed.load(Ordering::SeqCst) {
                drop(chain);
                shared.closed.store(true, Ordering::SeqCst);
                return Err(BridgeError::Closed);
            }
            let node = chain.append(shared.clone());
            *shared.membership.lock().unwrap() = Some(Membership {
                parent: Arc::downgrade(context),
                node,
            });
        }
        trace!(value = raw.to_bits(), "value chained");
        Ok(Value { shared })
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(BridgeError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn raw(&self) -> RawValue {
        self.shared.handle
    }

    pub(crate) fn context_handle(&self) -> RawContext {
        self.shared.context
    }

    /// The owning context core, via the membership receipt.
    fn parent(&self) -> Result<Arc<ContextShared>> {
        self.shared
            .membership
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|m| m.parent.upgrade())
            .ok_or(BridgeError::Closed)
    }

    fn inspect(&self) -> BridgeError {
        BridgeError::Script(self.shared.calls.context_error_info(self.shared.context))
    }

    fn check_same_context(&self, item: &Value) -> Result<()> {
        item.ensure_open()?;
        if item.shared.context != self.shared.context {
            return Err(BridgeError::ForeignValue);
        }
        Ok(())
    }

    pub fn tag(&self) -> Result<ValueTag> {
        self.ensure_open()?;
        Ok(self.shared.calls.value_tag(self.shared.context, self.shared.handle))
    }

    pub fn to_int(&self) -> Result<i64> {
        self.ensure_open()?;
        self.shared
            .calls
            .value_to_int(self.shared.context, self.shared.handle)
            .map_err(|_| self.inspect())
    }

    pub fn to_flt(&self) -> Result<f64> {
        self.ensure_open()?;
        self.shared
            .calls
            .value_to_flt(self.shared.context, self.shared.handle)
            .map_err(|_| self.inspect())
    }

    pub fn to_str(&self) -> Result<String> {
        self.ensure_open()?;
        self.shared
            .calls
            .value_to_str(self.shared.context, self.shared.handle)
            .map_err(|_| self.inspect())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.shared
            .calls
            .value_to_bytes(self.shared.context, self.shared.handle)
            .map_err(|_| self.inspect())
    }

    /// Element count of a container, string or byte-string.
    pub fn len(&self) -> Result<usize> {
        self.ensure_open()?;
        self.shared
            .calls
            .value_len(self.shared.context, self.shared.handle)
            .map_err(|_| self.inspect())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Array element read; the element arrives as a fresh chained value.
    pub fn index(&self, index: i64) -> Result<Value> {
        self.ensure_open()?;
        let parent = self.parent()?;
        let raw = self
            .shared
            .calls
            .value_index_get(self.shared.context, self.shared.handle, index)
            .map_err(|_| self.inspect())?;
        Value::bind(&parent, raw)
    }

    /// Array element write. The array holds its own reference unit for
    /// the element; `item` keeps the one it had.
    pub fn set_index(&self, index: i64, item: &Value) -> Result<()> {
        self.ensure_open()?;
        self.check_same_context(item)?;
        // The container takes over the extra unit, error or not.
        self.shared.calls.value_ref_up(self.shared.context, item.raw());
        self.shared
            .calls
            .value_index_set(self.shared.context, self.shared.handle, index, item.raw())
            .map_err(|_| self.inspect())
    }

    /// Map field read; the field arrives as a fresh chained value.
    pub fn key(&self, key: &str) -> Result<Value> {
        self.ensure_open()?;
        let parent = self.parent()?;
        let raw = self
            .shared
            .calls
            .value_key_get(self.shared.context, self.shared.handle, key)
            .map_err(|_| self.inspect())?;
        Value::bind(&parent, raw)
    }

    /// Map field write. The map holds its own reference unit for the
    /// field; `item` keeps the one it had.
    pub fn set_key(&self, key: &str, item: &Value) -> Result<()> {
        self.ensure_open()?;
        self.check_same_context(item)?;
        // The container takes over the extra unit, error or not.
        self.shared.calls.value_ref_up(self.shared.context, item.raw());
        self.shared
            .calls
            .value_key_set(self.shared.context, self.shared.handle, key, item.raw())
            .map_err(|_| self.inspect())
    }

    /// Iterate the fields of an array or map. Each yielded element is a
    /// fresh chained value the caller is responsible for closing.
    pub fn fields(&self) -> Fields<'_> {
        Fields {
            value: self,
            cursor: None,
            done: false,
        }
    }

    /// Human-readable rendering; never fails.
    pub fn display(&self) -> String {
        if self.shared.closed.load(Ordering::SeqCst) {
            return "<closed>".to_string();
        }
        self.shared
            .calls
            .value_display(self.shared.context, self.shared.handle)
    }

    /// Release this value's reference unit. Safe to call any number of
    /// times, from any clone.
    pub fn close(&self) {
        self.shared.teardown();
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("handle", &self.shared.handle)
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Iterator over the fields of a container value.
pub struct Fields<'a> {
    value: &'a Value,
    cursor: Option<FieldCursor>,
    done: bool,
}

impl Iterator for Fields<'_> {
    type Item = Result<(FieldKey, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step: Result<Option<(FieldKey, Value)>> = (|| {
            self.value.ensure_open()?;
            let parent = self.value.parent()?;
            let calls = &self.value.shared.calls;
            let entry = match self.cursor {
                None => calls.value_fields_first(self.value.shared.context, self.value.raw()),
                Some(cursor) => {
                    calls.value_fields_next(self.value.shared.context, self.value.raw(), cursor)
                }
            }
            .map_err(|_| self.value.inspect())?;
            match entry {
                Some(entry) => {
                    self.cursor = Some(entry.cursor);
                    Ok(Some((entry.key, Value::bind(&parent, entry.value)?)))
                }
                None => Ok(None),
            }
        })();
        match step {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
