//! Opaque engine-side handles with generational indices
//!
//! The engine never hands out pointers. Every object it owns is referenced
//! by a 64-bit handle packing a slot index and a generation counter; the
//! generation is bumped whenever a slot is recycled, so a stale handle is
//! detected instead of silently resolving to an unrelated object.

/// Handle to an engine instance.
///
/// Format: [32-bit generation | 32-bit index]
/// - Index: slot position inside the engine library
/// - Generation: incremented when the slot is reused
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RawEngine {
    index: u32,
    generation: u32,
}

/// Handle to an execution context belonging to some engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RawContext {
    index: u32,
    generation: u32,
}

/// Handle to a refcounted value cell owned by a context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RawValue {
    index: u32,
    generation: u32,
}

macro_rules! handle_impl {
    ($name:ident) => {
        impl $name {
            pub const fn from_parts(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }

            pub fn index(&self) -> u32 {
                self.index
            }

            pub fn generation(&self) -> u32 {
                self.generation
            }

            /// Pack into a 64-bit integer (for logging and extension data)
            pub fn to_bits(&self) -> u64 {
                ((self.generation as u64) << 32) | (self.index as u64)
            }

            /// Unpack from a 64-bit integer
            pub fn from_bits(bits: u64) -> Self {
                Self {
                    index: bits as u32,
                    generation: (bits >> 32) as u32,
                }
            }
        }
    };
}

handle_impl!(RawEngine);
handle_impl!(RawContext);
handle_impl!(RawValue);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_round_trip() {
        let h = RawValue::from_parts(7, 3);
        assert_eq!(h.to_bits(), (3u64 << 32) | 7);
        assert_eq!(RawValue::from_bits(h.to_bits()), h);
    }

    #[test]
    fn generation_distinguishes_reused_slots() {
        let old = RawContext::from_parts(4, 1);
        let new = RawContext::from_parts(4, 2);
        assert_ne!(old, new);
        assert_eq!(old.index(), new.index());
    }
}
