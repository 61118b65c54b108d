//! The shared trace store: per-location headers plus ring-buffered
//! operand logs, and the lossy logging discipline that fills them.
//!
//! The map is allocated once by the fuzzing harness before instrumentation
//! begins and lives for the whole process. Probes reference it, they never
//! own it. No lock or atomic protects it: concurrently executing target
//! threads may tear `hits` increments, category switches and ring entries.
//! The log is a heuristic signal and tolerates this loss; synchronizing
//! every comparison the target executes would not.

#[cfg(feature = "alloc")]
use alloc::{
    alloc::{alloc_zeroed, handle_alloc_error},
    boxed::Box,
};
#[cfg(feature = "alloc")]
use core::alloc::Layout;
use core::{
    fmt::{self, Debug, Formatter},
    mem::{size_of, zeroed},
    ptr, slice,
};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize, Serializer};
use static_assertions::{const_assert, const_assert_eq};

use crate::{resolve::TraceEvent, Error};

/// The number of code-location slots in the trace map.
pub const TRACE_MAP_W: usize = 65536;
/// Ring capacity of a compare slot.
pub const TRACE_MAP_H: usize = 32;
/// Ring capacity of a routine slot.
pub const TRACE_MAP_RTN_H: usize = 32;
/// The number of bytes captured behind each routine-argument pointer.
pub const TRACE_RTN_LEN: usize = 31;
/// The shape value marking a byte-buffer payload.
pub const RTN_SHAPE: u8 = (TRACE_RTN_LEN - 1) as u8;

const_assert!(TRACE_MAP_W.is_power_of_two());
const_assert!(TRACE_MAP_H.is_power_of_two());
const_assert!(TRACE_MAP_RTN_H.is_power_of_two());

/// Reduce a code address to a slot index.
///
/// Pure and deterministic. Distinct addresses may alias one slot; the
/// collision stays unresolved, trading precision for a fixed-size map.
#[inline]
#[must_use]
pub fn slot_index(address: u64) -> usize {
    let hash = (address >> 4) ^ (address << 8);
    (hash as usize) & (TRACE_MAP_W - 1)
}

/// The kind of events a slot currently holds.
#[repr(u8)]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
pub enum TraceKind {
    /// No event recorded yet.
    #[default]
    Empty = 0,
    /// Operand values of comparison-class instructions.
    Compare = 1,
    /// Argument buffers of call-class instructions.
    Routine = 2,
}

/// The per-slot header of the trace map.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceHeader {
    kind: u8,
    shape: u8,
    hits: u32,
}

impl TraceHeader {
    /// The slot's current category. Unknown (torn) tag bytes read as
    /// [`TraceKind::Empty`].
    #[must_use]
    pub fn kind(&self) -> TraceKind {
        TraceKind::try_from(self.kind).unwrap_or(TraceKind::Empty)
    }

    /// Operand byte-width minus one for compare slots, [`RTN_SHAPE`] for
    /// routine slots. Meaningless while the slot is empty.
    #[must_use]
    pub fn shape(&self) -> u8 {
        self.shape
    }

    /// Events observed for this slot since its last category change.
    #[must_use]
    pub fn hits(&self) -> u32 {
        self.hits
    }
}

/// One compare ring entry: both operand values, zero-extended to 64 bit.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompareOperands {
    /// The first operand value.
    pub v0: u64,
    /// The second operand value.
    pub v1: u64,
}

/// One routine ring entry: the leading bytes behind both pointer
/// arguments, plus their captured lengths (always [`TRACE_RTN_LEN`] in the
/// current design).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutineOperands {
    /// Bytes behind the first argument pointer.
    pub v0: [u8; TRACE_RTN_LEN],
    /// Bytes behind the second argument pointer.
    pub v1: [u8; TRACE_RTN_LEN],
    /// Captured length of `v0`.
    pub v0_len: u8,
    /// Captured length of `v1`.
    pub v1_len: u8,
}

/// The per-slot operand rings, overlaid per category.
#[repr(C)]
#[derive(Clone, Copy)]
pub union TraceLog {
    compares: [[CompareOperands; TRACE_MAP_H]; TRACE_MAP_W],
    routines: [[RoutineOperands; TRACE_MAP_RTN_H]; TRACE_MAP_W],
}

impl Debug for TraceLog {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceLog").finish_non_exhaustive()
    }
}

const_assert_eq!(size_of::<TraceHeader>(), 8);
const_assert_eq!(size_of::<CompareOperands>(), 16);
const_assert_eq!(size_of::<RoutineOperands>(), 64);

/// The process-wide trace store: `TRACE_MAP_W` headers parallel to
/// `TRACE_MAP_W` fixed-capacity rings.
///
/// The layout is `repr(C)` and read as-is by the downstream mutation
/// engine; [`TraceMap::as_bytes`] exposes the raw image for that purpose.
/// Writes race freely between threads, see the module docs.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TraceMap {
    headers: [TraceHeader; TRACE_MAP_W],
    log: TraceLog,
}

impl Default for TraceMap {
    /// An all-empty map. Prefer [`TraceMap::boxed`]: the map does not fit
    /// the stack with default runtime configuration.
    fn default() -> Self {
        unsafe { zeroed() }
    }
}

impl TraceMap {
    /// The number of code-location slots.
    #[must_use]
    #[expect(clippy::unused_self)]
    pub fn len(&self) -> usize {
        TRACE_MAP_W
    }

    /// Whether the map has no slots (it never has).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The header of slot `idx`.
    #[must_use]
    pub fn header(&self, idx: usize) -> &TraceHeader {
        &self.headers[idx]
    }

    /// The number of events observed for slot `idx`.
    #[must_use]
    pub fn executions_for(&self, idx: usize) -> usize {
        self.headers[idx].hits as usize
    }

    /// The number of ring entries of slot `idx` that hold live data.
    ///
    /// Entries beyond `min(hits, capacity)` are stale leftovers of an
    /// earlier category and are never surfaced.
    #[must_use]
    pub fn usable_executions_for(&self, idx: usize) -> usize {
        let capacity = match self.headers[idx].kind() {
            TraceKind::Empty => 0,
            TraceKind::Compare => TRACE_MAP_H,
            TraceKind::Routine => TRACE_MAP_RTN_H,
        };
        self.executions_for(idx).min(capacity)
    }

    /// The logged values of ring entry `execution` in slot `idx`.
    ///
    /// Returns `None` for empty slots, out-of-range entries and shapes
    /// that a torn write left unintelligible.
    #[must_use]
    pub fn values_of(&self, idx: usize, execution: usize) -> Option<TraceValues> {
        if execution >= self.usable_executions_for(idx) {
            return None;
        }

        match self.headers[idx].kind() {
            TraceKind::Empty => None,
            TraceKind::Compare => {
                let entry = unsafe { self.log.compares[idx][execution] };
                match self.headers[idx].shape() {
                    0 => Some(TraceValues::U8((entry.v0 as u8, entry.v1 as u8))),
                    1 => Some(TraceValues::U16((entry.v0 as u16, entry.v1 as u16))),
                    3 => Some(TraceValues::U32((entry.v0 as u32, entry.v1 as u32))),
                    7 => Some(TraceValues::U64((entry.v0, entry.v1))),
                    _ => None,
                }
            }
            TraceKind::Routine => {
                let entry = unsafe { self.log.routines[idx][execution] };
                Some(TraceValues::Bytes((
                    TraceBytes::from_buf_and_len(entry.v0, entry.v0_len),
                    TraceBytes::from_buf_and_len(entry.v1, entry.v1_len),
                )))
            }
        }
    }

    /// Clear all headers, logically emptying every slot.
    ///
    /// For performance, the ring payloads are left in place; they are
    /// unreachable behind `hits == 0` headers.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.headers.fill(TraceHeader::default());
        Ok(())
    }

    /// Record one resolved event at its hashed slot.
    #[inline]
    pub fn record(&mut self, event: &TraceEvent) {
        match *event {
            TraceEvent::Compare {
                address,
                width,
                v0,
                v1,
            } => self.log_instruction(slot_index(address), width, v0, v1),
            TraceEvent::Routine { address, v0, v1 } => {
                self.log_routine(slot_index(address), &v0, &v1);
            }
        }
    }

    /// Append a compare pair to slot `k`'s ring, overwriting on wrap.
    #[inline]
    pub fn log_instruction(&mut self, k: usize, width: u8, v0: u64, v1: u64) {
        let header = &mut self.headers[k];
        if header.kind != u8::from(TraceKind::Compare) {
            header.hits = 0;
        }

        let hits = header.hits;
        if hits == 0 {
            header.kind = TraceKind::Compare.into();
            header.shape = width - 1;
        }
        header.hits = hits.wrapping_add(1);

        let pos = hits as usize & (TRACE_MAP_H - 1);
        // Sound regardless of the previously active view: both union
        // fields are plain-old-data over the same storage.
        unsafe {
            self.log.compares[k][pos] = CompareOperands { v0, v1 };
        }
    }

    /// Append a routine argument pair to slot `k`'s ring, overwriting on
    /// wrap.
    #[inline]
    pub fn log_routine(
        &mut self,
        k: usize,
        v0: &[u8; TRACE_RTN_LEN],
        v1: &[u8; TRACE_RTN_LEN],
    ) {
        let header = &mut self.headers[k];
        if header.kind != u8::from(TraceKind::Routine) {
            header.hits = 0;
        }

        let hits = header.hits;
        if hits == 0 {
            header.kind = TraceKind::Routine.into();
            header.shape = RTN_SHAPE;
        }
        header.hits = hits.wrapping_add(1);

        let pos = hits as usize & (TRACE_MAP_RTN_H - 1);
        unsafe {
            self.log.routines[k][pos] = RoutineOperands {
                v0: *v0,
                v1: *v1,
                v0_len: TRACE_RTN_LEN as u8,
                v1_len: TRACE_RTN_LEN as u8,
            };
        }
    }

    /// The raw byte image of the map, e.g. for handing the finished log
    /// to the mutation engine over shared memory.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(ptr::from_ref(self).cast::<u8>(), size_of::<Self>()) }
    }
}

#[cfg(feature = "alloc")]
impl TraceMap {
    /// Allocate a zeroed map on the heap.
    ///
    /// This is the supported way for a harness to create the map: it is
    /// far too large to be created on the stack.
    #[must_use]
    pub fn boxed() -> Box<Self> {
        let layout = Layout::new::<Self>();
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        // All-zero bytes are a valid map: every slot is `Empty`.
        unsafe { Box::from_raw(ptr.cast::<Self>()) }
    }

    /// Rebuild a map from a raw byte image captured with
    /// [`TraceMap::as_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Box<Self>, Error> {
        if bytes.len() != size_of::<Self>() {
            return Err(Error::illegal_argument(format!(
                "trace map image is {} bytes, expected {}",
                bytes.len(),
                size_of::<Self>()
            )));
        }

        let mut map = Self::boxed();
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                ptr::from_mut(map.as_mut()).cast::<u8>(),
                size_of::<Self>(),
            );
        }
        Ok(map)
    }
}

impl Serialize for TraceMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(self.as_bytes())
    }
}

/// A routine-argument byte capture plus its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceBytes {
    buf: [u8; TRACE_RTN_LEN],
    len: u8,
}

impl TraceBytes {
    /// Wrap a captured buffer and its length.
    #[must_use]
    pub fn from_buf_and_len(buf: [u8; TRACE_RTN_LEN], len: u8) -> Self {
        Self { buf, len }
    }

    /// The captured bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..usize::from(self.len).min(TRACE_RTN_LEN)]
    }

    /// The captured length.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// Whether nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The operand values read back from one ring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceValues {
    /// Two u8 values.
    U8((u8, u8)),
    /// Two u16 values.
    U16((u16, u16)),
    /// Two u32 values.
    U32((u32, u32)),
    /// Two u64 values.
    U64((u64, u64)),
    /// Two byte buffers.
    Bytes((TraceBytes, TraceBytes)),
}

impl TraceValues {
    /// Returns if the values are numerical.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            TraceValues::U8(_) | TraceValues::U16(_) | TraceValues::U32(_) | TraceValues::U64(_)
        )
    }

    /// Converts the value to a u64 tuple.
    #[must_use]
    pub fn to_u64_tuple(&self) -> Option<(u64, u64)> {
        match self {
            TraceValues::U8(t) => Some((u64::from(t.0), u64::from(t.1))),
            TraceValues::U16(t) => Some((u64::from(t.0), u64::from(t.1))),
            TraceValues::U32(t) => Some((u64::from(t.0), u64::from(t.1))),
            TraceValues::U64(t) => Some(*t),
            TraceValues::Bytes(_) => None,
        }
    }
}
