//! Connection-oriented, buffer-granular transport abstraction (spec.md
//! §4.5, C5 / "XNI"). Two implementations exist: `tcp` (always
//! available) and `ib` (feature `ib`, IB verbs).

pub mod header;
pub mod tcp;
#[cfg(feature = "ib")]
pub mod ib;

use crate::error::Result;

/// Raised by `receive_target_buffer` when the peer has closed the
/// connection (source sent EOF, or every underlying socket/QP hit EOF).
#[derive(Debug, Clone, Copy)]
pub struct Eof;

/// Ordered list of `(host, base_port, port_count)` triples. The k-th
/// worker of an E2E target is assigned to the k-th `(host, port)` pair
/// obtained by flattening this table in order (spec.md §3 "Address
/// Table").
#[derive(Debug, Clone)]
pub struct AddressTable {
    entries: Vec<(String, u16, u16)>,
}

impl AddressTable {
    pub fn new(entries: Vec<(String, u16, u16)>) -> Self {
        Self { entries }
    }

    /// Total port count across all entries; must equal the target's
    /// queue depth.
    pub fn total_ports(&self) -> u16 {
        self.entries.iter().map(|(_, _, count)| count).sum()
    }

    /// The `(host, port)` pair assigned to worker `k`, by flattening the
    /// table in order.
    pub fn worker_endpoint(&self, k: u16) -> Option<(String, u16)> {
        let mut remaining = k;
        for (host, base_port, count) in &self.entries {
            if remaining < *count {
                return Some((host.clone(), base_port + remaining));
            }
            remaining -= count;
        }
        None
    }
}

/// A transport-visible buffer carrying payload plus offset/sequence
/// metadata (spec.md §3 "Buffer" / §4.5 "TargetBuffer"). Does not own the
/// backing memory: it borrows it from the `Buffer` the worker owns for
/// the duration the transport holds it.
pub struct TargetBuffer {
    data: *mut u8,
    capacity: usize,
    target_offset: u64,
    data_length: u64,
    sequence_number: u64,
}

// SAFETY: a `TargetBuffer` is handed between exactly one producer thread
// and one consumer thread at a time (transport <-> worker), never shared
// concurrently; the pointee outlives the handoff because the owning
// `Buffer` is not dropped while registered.
unsafe impl Send for TargetBuffer {}

impl TargetBuffer {
    /// # Safety
    /// `data` must be valid for `capacity` bytes for as long as this
    /// `TargetBuffer` (and any clone of the raw parts) is alive.
    pub unsafe fn from_raw_parts(data: *mut u8, capacity: usize) -> Self {
        Self { data, capacity, target_offset: 0, data_length: 0, sequence_number: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn target_offset(&self) -> u64 {
        self.target_offset
    }

    pub fn set_target_offset(&mut self, offset: u64) {
        self.target_offset = offset;
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }

    pub fn set_data_length(&mut self, len: u64) {
        debug_assert!(len as usize <= self.capacity);
        self.data_length = len;
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, seq: u64) {
        self.sequence_number = seq;
    }

    /// The data region, guaranteed 512-byte aligned per spec.md §4.5.
    pub fn data(&self) -> &[u8] {
        // SAFETY: see `from_raw_parts`'s contract.
        unsafe { std::slice::from_raw_parts(self.data, self.data_length as usize) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.data_length.max(0) as usize;
        // SAFETY: see `from_raw_parts`'s contract; `&mut self` excludes
        // concurrent access.
        unsafe { std::slice::from_raw_parts_mut(self.data, len.min(self.capacity)) }
    }

    pub fn full_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `from_raw_parts`'s contract.
        unsafe { std::slice::from_raw_parts_mut(self.data, self.capacity) }
    }
}

/// Per-process transport setup parameters. TCP uses `bind_host` and the
/// `socket_count` hint (defaults to the buffer/queue-depth count); IB
/// uses the rest.
#[derive(Debug, Clone, Default)]
pub struct ControlBlock {
    pub socket_count: Option<usize>,
    pub send_buffer_bytes: Option<usize>,
    pub recv_buffer_bytes: Option<usize>,
    pub congestion_control: Option<String>,
}

/// A connection-oriented, buffer-granular transport. Source-side callers
/// use `connect` + `request_target_buffer`/`send_target_buffer`;
/// destination-side callers use `accept` + `receive_target_buffer`/
/// `release_target_buffer`.
pub trait Transport: Send + Sync {
    type Connection: Send;

    /// Register a caller-owned buffer for zero-copy use. `reserved`
    /// bytes at the front are left for transport framing.
    fn register_buffer(&self, data: *mut u8, size: usize, reserved: usize);

    /// Destination side: block until a peer connects at each `(host,
    /// port)` pair, one per fan-out socket (spec.md §3 "Address Table":
    /// the k-th socket binds the k-th pair, flattening the table in
    /// order). Implementations that use a single out-of-band rendezvous
    /// address instead of per-socket addresses (e.g. IB) read only the
    /// first entry.
    fn accept(&self, endpoints: &[(String, u16)]) -> Result<Self::Connection>;

    /// Source side: connect to a destination's `(host, port)` pairs, one
    /// per fan-out socket. See `accept`.
    fn connect(&self, endpoints: &[(String, u16)]) -> Result<Self::Connection>;

    /// Source side: obtain a writable buffer to fill before sending.
    fn request_target_buffer(&self, conn: &Self::Connection) -> Result<TargetBuffer>;

    /// Source side: hand a filled buffer to the transport. `target_offset`
    /// and `data_length` must already be set on `buffer`.
    fn send_target_buffer(&self, conn: &Self::Connection, buffer: TargetBuffer) -> Result<()>;

    /// Destination side: receive the next buffer, or `Eof` once the
    /// source has closed.
    fn receive_target_buffer(
        &self,
        conn: &Self::Connection,
    ) -> std::result::Result<TargetBuffer, Eof>;

    /// Destination side: return a received buffer to the transport.
    fn release_target_buffer(&self, conn: &Self::Connection, buffer: TargetBuffer);

    /// Source side: close the connection. The destination observes this
    /// as `Eof` on its next `receive_target_buffer`.
    fn close(&self, conn: Self::Connection) -> Result<()>;
}

/// Object-safe view of a `Transport` bound to one connection, used by
/// workers so they need not be generic over the transport's `Connection`
/// associated type. One `BoundConnection` is shared (via `Arc`) by every
/// worker of an E2E target.
pub struct BoundConnection<T: Transport> {
    pub transport: std::sync::Arc<T>,
    pub connection: T::Connection,
}

impl<T: Transport> BoundConnection<T> {
    pub fn new(transport: std::sync::Arc<T>, connection: T::Connection) -> Self {
        Self { transport, connection }
    }
}

/// The subset of `Transport` a worker needs once its connection has
/// already been established (spec.md §4.6 steps 1 and 8).
pub trait E2EChannel: Send + Sync {
    fn request_target_buffer(&self) -> Result<TargetBuffer>;
    fn send_target_buffer(&self, buffer: TargetBuffer) -> Result<()>;
    fn receive_target_buffer(&self) -> std::result::Result<TargetBuffer, Eof>;
    fn release_target_buffer(&self, buffer: TargetBuffer);
}

impl<T: Transport> E2EChannel for BoundConnection<T> {
    fn request_target_buffer(&self) -> Result<TargetBuffer> {
        self.transport.request_target_buffer(&self.connection)
    }

    fn send_target_buffer(&self, buffer: TargetBuffer) -> Result<()> {
        self.transport.send_target_buffer(&self.connection, buffer)
    }

    fn receive_target_buffer(&self) -> std::result::Result<TargetBuffer, Eof> {
        self.transport.receive_target_buffer(&self.connection)
    }

    fn release_target_buffer(&self, buffer: TargetBuffer) {
        self.transport.release_target_buffer(&self.connection, buffer)
    }
}
