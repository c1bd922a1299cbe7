//! Per-context refcounted value heap
//!
//! Every script value is a cell in its context's heap, referenced by a
//! generational `RawValue` handle. Reference counting is manual and exact:
//! whoever holds a unit releases it, containers own one unit per element.
//! Misuse (stale handles, refcount underflow) indicates a host-side bug
//! and panics rather than corrupting the heap.

use std::collections::BTreeMap;

use kestrel_api::RawValue;

use crate::arena::Arena;

/// Stored form of one value cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Nil,
    Int(i64),
    Flt(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Dense array; `None` slots are unset and read back as nil.
    Arr(Vec<Option<RawValue>>),
    /// Keyed fields in key order.
    Map(BTreeMap<String, RawValue>),
    /// Named script function (not constructible from host code).
    Fun(String),
}

#[derive(Debug)]
struct Cell {
    refs: u32,
    payload: Payload,
}

#[derive(Debug, Default)]
pub struct Heap {
    cells: Arena<Cell>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            cells: Arena::new(),
        }
    }

    /// Allocate a cell with refcount 1 and hand its unit to the caller.
    pub fn alloc(&mut self, payload: Payload) -> RawValue {
        let (index, generation) = self.cells.insert(Cell { refs: 1, payload });
        RawValue::from_parts(index, generation)
    }

    fn cell(&self, h: RawValue) -> &Cell {
        self.cells
            .get(h.index(), h.generation())
            .unwrap_or_else(|| panic!("stale value handle {:#x}", h.to_bits()))
    }

    fn cell_mut(&mut self, h: RawValue) -> &mut Cell {
        self.cells
            .get_mut(h.index(), h.generation())
            .unwrap_or_else(|| panic!("stale value handle {:#x}", h.to_bits()))
    }

    pub fn payload(&self, h: RawValue) -> &Payload {
        &self.cell(h).payload
    }

    pub fn payload_mut(&mut self, h: RawValue) -> &mut Payload {
        &mut self.cell_mut(h).payload
    }

    pub fn refs(&self, h: RawValue) -> u32 {
        self.cell(h).refs
    }

    pub fn retain(&mut self, h: RawValue) {
        let cell = self.cell_mut(h);
        cell.refs = cell
            .refs
            .checked_add(1)
            .unwrap_or_else(|| panic!("refcount overflow on value {:#x}", h.to_bits()));
    }

    /// Give back one unit. Freeing a container releases the units it holds
    /// on its elements; the worklist keeps deep structures off the stack.
    pub fn release(&mut self, h: RawValue) {
        let mut work = vec![h];
        while let Some(h) = work.pop() {
            let cell = self.cell_mut(h);
            if cell.refs == 0 {
                panic!("refcount underflow on value {:#x}", h.to_bits());
            }
            cell.refs -= 1;
            if cell.refs > 0 {
                continue;
            }
            let dead = self
                .cells
                .remove(h.index(), h.generation())
                .expect("cell vanished during release");
            match dead.payload {
                Payload::Arr(items) => work.extend(items.into_iter().flatten()),
                Payload::Map(fields) => work.extend(fields.into_values()),
                _ => {}
            }
        }
    }

    /// Number of live cells (debug/verification accessor).
    pub fn live(&self) -> usize {
        self.cells.live()
    }

    // ------------------------------------------------------------------
    // conversions (shared by the call surface and the script builtins)
    // ------------------------------------------------------------------

    /// Lenient numeric conversion: strings convert by their leading
    /// numeric prefix, nil converts to zero, containers refuse.
    pub fn coerce_int(&self, h: RawValue) -> Result<i64, String> {
        match self.payload(h) {
            Payload::Nil => Ok(0),
            Payload::Int(v) => Ok(*v),
            Payload::Flt(v) => Ok(*v as i64),
            Payload::Str(s) => Ok(lenient_i64(s)),
            Payload::Bytes(b) => Ok(lenient_i64(&String::from_utf8_lossy(b))),
            other => Err(format!("cannot convert {} to int", tag_of(other))),
        }
    }

    pub fn coerce_flt(&self, h: RawValue) -> Result<f64, String> {
        match self.payload(h) {
            Payload::Nil => Ok(0.0),
            Payload::Int(v) => Ok(*v as f64),
            Payload::Flt(v) => Ok(*v),
            Payload::Str(s) => Ok(lenient_f64(s)),
            Payload::Bytes(b) => Ok(lenient_f64(&String::from_utf8_lossy(b))),
            other => Err(format!("cannot convert {} to flt", tag_of(other))),
        }
    }

    /// String conversion; nil converts to the empty string (unlike
    /// `display`, which renders it as "nil").
    pub fn coerce_str(&self, h: RawValue) -> Result<String, String> {
        match self.payload(h) {
            Payload::Nil => Ok(String::new()),
            Payload::Int(v) => Ok(v.to_string()),
            Payload::Flt(v) => Ok(v.to_string()),
            Payload::Str(s) => Ok(s.clone()),
            Payload::Bytes(b) => Ok(String::from_utf8_lossy(b).into_owned()),
            other => Err(format!("cannot convert {} to str", tag_of(other))),
        }
    }

    pub fn coerce_bytes(&self, h: RawValue) -> Result<Vec<u8>, String> {
        match self.payload(h) {
            Payload::Nil => Ok(Vec::new()),
            Payload::Int(v) => Ok(v.to_string().into_bytes()),
            Payload::Flt(v) => Ok(v.to_string().into_bytes()),
            Payload::Str(s) => Ok(s.clone().into_bytes()),
            Payload::Bytes(b) => Ok(b.clone()),
            other => Err(format!("cannot convert {} to bytes", tag_of(other))),
        }
    }

    /// Element count: set array slots, map entries, string/byte length.
    pub fn length(&self, h: RawValue) -> Result<usize, String> {
        match self.payload(h) {
            Payload::Str(s) => Ok(s.len()),
            Payload::Bytes(b) => Ok(b.len()),
            Payload::Arr(items) => Ok(items.iter().flatten().count()),
            Payload::Map(fields) => Ok(fields.len()),
            other => Err(format!("value of type {} has no length", tag_of(other))),
        }
    }

    /// Human-readable rendering. Containers render their elements up to a
    /// fixed nesting depth so reference cycles cannot hang the renderer.
    pub fn display(&self, h: RawValue) -> String {
        self.display_depth(h, 0)
    }

    fn display_depth(&self, h: RawValue, depth: usize) -> String {
        const MAX_DEPTH: usize = 8;
        if depth > MAX_DEPTH {
            return "...".into();
        }
        match self.payload(h) {
            Payload::Nil => "nil".into(),
            Payload::Int(v) => v.to_string(),
            Payload::Flt(v) => v.to_string(),
            Payload::Str(v) => v.clone(),
            Payload::Bytes(v) => String::from_utf8_lossy(v).into_owned(),
            Payload::Arr(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .map(|slot| match slot {
                        Some(h) => self.display_depth(*h, depth + 1),
                        None => "nil".into(),
                    })
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            Payload::Map(fields) => {
                let parts: Vec<String> = fields
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, self.display_depth(*v, depth + 1)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Payload::Fun(name) => format!("fun {}", name),
        }
    }
}

/// Tag name of a payload, for error messages.
pub fn tag_of(payload: &Payload) -> &'static str {
    match payload {
        Payload::Nil => "nil",
        Payload::Int(_) => "int",
        Payload::Flt(_) => "flt",
        Payload::Str(_) => "str",
        Payload::Bytes(_) => "bytes",
        Payload::Arr(_) => "arr",
        Payload::Map(_) => "map",
        Payload::Fun(_) => "fun",
    }
}

/// Parse the leading integer of a string, zero when there is none.
fn lenient_i64(s: &str) -> i64 {
    let t = s.trim_start();
    let b = t.as_bytes();
    let mut i = 0;
    if matches!(b.first(), Some(b'+' | b'-')) {
        i = 1;
    }
    let mut end = 0;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
        end = i;
    }
    t[..end].parse().unwrap_or(0)
}

/// Parse the leading number of a string, zero when there is none.
fn lenient_f64(s: &str) -> f64 {
    let t = s.trim_start();
    let b = t.as_bytes();
    let mut i = 0;
    if matches!(b.first(), Some(b'+' | b'-')) {
        i = 1;
    }
    let mut end = 0;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
        end = i;
    }
    if i < b.len() && b[i] == b'.' {
        let mut j = i + 1;
        while j < b.len() && b[j].is_ascii_digit() {
            j += 1;
        }
        if j > i + 1 {
            end = j;
        }
    }
    t[..end].parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_starts_at_one_unit() {
        let mut heap = Heap::new();
        let h = heap.alloc(Payload::Int(9));
        assert_eq!(heap.refs(h), 1);
        heap.release(h);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn retain_release_balance() {
        let mut heap = Heap::new();
        let h = heap.alloc(Payload::Str("x".into()));
        heap.retain(h);
        heap.release(h);
        assert_eq!(heap.refs(h), 1);
        heap.release(h);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn freeing_container_releases_elements() {
        let mut heap = Heap::new();
        let a = heap.alloc(Payload::Int(1));
        let b = heap.alloc(Payload::Int(2));
        // The array takes over the caller's units.
        let arr = heap.alloc(Payload::Arr(vec![Some(a), None, Some(b)]));
        assert_eq!(heap.live(), 3);
        heap.release(arr);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn shared_element_survives_container() {
        let mut heap = Heap::new();
        let item = heap.alloc(Payload::Int(5));
        heap.retain(item); // one unit for us, one for the map
        let mut fields = BTreeMap::new();
        fields.insert("k".to_string(), item);
        let map = heap.alloc(Payload::Map(fields));
        heap.release(map);
        assert_eq!(heap.refs(item), 1);
        heap.release(item);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    #[should_panic(expected = "stale value handle")]
    fn stale_handle_panics() {
        let mut heap = Heap::new();
        let h = heap.alloc(Payload::Nil);
        heap.release(h);
        heap.refs(h);
    }

    #[test]
    #[should_panic(expected = "stale value handle")]
    fn over_release_panics() {
        // Dropping the last unit frees the cell, so a further release is a
        // stale-handle access.
        let mut heap = Heap::new();
        let h = heap.alloc(Payload::Int(0));
        heap.release(h);
        heap.release(h);
    }

    #[test]
    fn lenient_numeric_conversion() {
        let mut heap = Heap::new();
        let h = heap.alloc(Payload::Str("  42abc".into()));
        assert_eq!(heap.coerce_int(h), Ok(42));
        heap.release(h);

        let h = heap.alloc(Payload::Str("abc".into()));
        assert_eq!(heap.coerce_int(h), Ok(0));
        assert_eq!(heap.coerce_flt(h), Ok(0.0));
        heap.release(h);

        let h = heap.alloc(Payload::Str("-3.5x".into()));
        assert_eq!(heap.coerce_flt(h), Ok(-3.5));
        heap.release(h);
    }

    #[test]
    fn containers_refuse_scalar_conversion() {
        let mut heap = Heap::new();
        let m = heap.alloc(Payload::Map(BTreeMap::new()));
        assert_eq!(
            heap.coerce_int(m),
            Err("cannot convert map to int".to_string())
        );
        heap.release(m);
    }

    #[test]
    fn length_counts_set_array_slots() {
        let mut heap = Heap::new();
        let a = heap.alloc(Payload::Int(1));
        let arr = heap.alloc(Payload::Arr(vec![Some(a), None, None]));
        assert_eq!(heap.length(arr), Ok(1));
        heap.release(arr);
    }

    #[test]
    fn display_renders_nested_containers() {
        let mut heap = Heap::new();
        let one = heap.alloc(Payload::Int(1));
        let name = heap.alloc(Payload::Str("kes".into()));
        let arr = heap.alloc(Payload::Arr(vec![Some(one), Some(name)]));
        let mut fields = BTreeMap::new();
        fields.insert("items".to_string(), arr);
        let map = heap.alloc(Payload::Map(fields));
        assert_eq!(heap.display(map), "{items: [1, kes]}");
        heap.release(map);
    }
}
