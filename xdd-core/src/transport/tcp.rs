//! TCP fan-out transport: N stream sockets per connection, a free-socket
//! backpressure queue on the send side, and a per-socket reader thread on
//! the receive side feeding a shared inbound channel (spec.md §4.5 "TCP
//! implementation").
//!
//! Each wire message is the transport's own fixed 20-byte header
//! `{sequence: u64, target_offset: u64, data_length: u32}` in network
//! byte order, followed by `data_length` bytes of payload (spec.md §6).
//! This framing is independent of the 64-byte application-level
//! [`super::header::E2EHeader`]; workers write that header into the
//! front of the buffer they hand the transport, so from the transport's
//! point of view it is just more payload bytes.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use socket2::{Socket, TcpKeepalive};

use super::{ControlBlock, Eof, TargetBuffer, Transport};
use crate::error::{Result, XddError};

const WIRE_HEADER_LEN: usize = 20;

struct WireHeader {
    sequence: u64,
    target_offset: u64,
    data_length: u32,
}

impl WireHeader {
    fn encode(&self) -> [u8; WIRE_HEADER_LEN] {
        let mut buf = [0u8; WIRE_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.sequence.to_be_bytes());
        buf[8..16].copy_from_slice(&self.target_offset.to_be_bytes());
        buf[16..20].copy_from_slice(&self.data_length.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8; WIRE_HEADER_LEN]) -> Self {
        Self {
            sequence: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            target_offset: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            data_length: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        }
    }
}

struct InboundMessage {
    header: WireHeader,
    payload: Vec<u8>,
}

/// Pool of raw buffers registered for zero-copy use, guarded by a mutex +
/// condvar so `request_target_buffer` can block until one is available
/// (this is the "free buffer" half of the backpressure story; the
/// "free socket" half is `TcpConnection::free_sockets`).
#[derive(Default)]
struct BufferPoolState {
    free: VecDeque<(*mut u8, usize)>,
}

// SAFETY: pointers in the pool are only ever handed out one at a time
// (popped under the mutex) and are valid for the lifetime of the
// `TcpTransport` that registered them.
unsafe impl Send for BufferPoolState {}

struct RegisteredPool {
    state: Mutex<BufferPoolState>,
    cond: Condvar,
}

impl RegisteredPool {
    fn new() -> Self {
        Self { state: Mutex::new(BufferPoolState::default()), cond: Condvar::new() }
    }

    fn register(&self, ptr: *mut u8, size: usize) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.free.push_back((ptr, size));
        self.cond.notify_one();
    }

    fn take(&self) -> (*mut u8, usize) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while guard.free.is_empty() {
            guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        guard.free.pop_front().unwrap()
    }

    fn give_back(&self, ptr: *mut u8, size: usize) {
        self.register(ptr, size);
    }
}

/// One TCP fan-out connection: either the source side (a vector of
/// connected sockets plus a free-socket queue) or the destination side (a
/// vector of accepted sockets plus reader threads feeding `inbound`).
pub struct TcpConnection {
    sockets: Vec<Arc<Mutex<TcpStream>>>,
    free_sockets_tx: Sender<usize>,
    free_sockets_rx: Receiver<usize>,
    inbound_rx: Option<Receiver<InboundMessage>>,
    eof_sockets: Arc<AtomicUsize>,
    total_sockets: usize,
    reader_handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

fn apply_socket_options(stream: &TcpStream, control: &ControlBlock) -> Result<()> {
    let socket = Socket::from(stream.try_clone().map_err(|e| {
        XddError::Init(format!("failed to clone TCP stream for socket options: {e}"))
    })?);
    if let Some(bytes) = control.send_buffer_bytes {
        let _ = socket.set_send_buffer_size(bytes);
    }
    if let Some(bytes) = control.recv_buffer_bytes {
        let _ = socket.set_recv_buffer_size(bytes);
    }
    let _ = socket.set_tcp_keepalive(&TcpKeepalive::new());
    std::mem::forget(socket); // we only borrowed `stream`'s fd via try_clone
    Ok(())
}

pub struct TcpTransport {
    control: ControlBlock,
    pool: Arc<RegisteredPool>,
}

impl TcpTransport {
    pub fn new(control: ControlBlock) -> Self {
        Self { control, pool: Arc::new(RegisteredPool::new()) }
    }

    fn spawn_reader(
        socket: Arc<Mutex<TcpStream>>,
        tx: Sender<InboundMessage>,
        eof_sockets: Arc<AtomicUsize>,
        total_sockets: usize,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || loop {
            let mut header_buf = [0u8; WIRE_HEADER_LEN];
            let read_result = {
                let mut stream = socket.lock().unwrap_or_else(|e| e.into_inner());
                stream.read_exact(&mut header_buf)
            };
            match read_result {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    eof_sockets.fetch_add(1, Ordering::SeqCst);
                    let _ = total_sockets; // kept for clarity at call sites
                    return;
                }
                Err(_) => {
                    eof_sockets.fetch_add(1, Ordering::SeqCst);
                    return;
                }
            }
            let header = WireHeader::decode(&header_buf);
            let mut payload = vec![0u8; header.data_length as usize];
            let read_payload = {
                let mut stream = socket.lock().unwrap_or_else(|e| e.into_inner());
                stream.read_exact(&mut payload)
            };
            if read_payload.is_err() {
                eof_sockets.fetch_add(1, Ordering::SeqCst);
                return;
            }
            if tx.send(InboundMessage { header, payload }).is_err() {
                return;
            }
        })
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;

    fn register_buffer(&self, data: *mut u8, size: usize, reserved: usize) {
        // SAFETY: caller guarantees `data` is valid for `size` bytes for
        // as long as it stays registered; `reserved` bytes at the front
        // are left untouched by the transport (it only ever reads/writes
        // starting at `data.add(reserved)`).
        let usable_ptr = unsafe { data.add(reserved) };
        self.pool.register(usable_ptr, size - reserved);
    }

    fn connect(&self, endpoints: &[(String, u16)]) -> Result<Self::Connection> {
        if endpoints.is_empty() {
            return Err(XddError::Config("connect called with an empty endpoint list".into()));
        }
        let n = endpoints.len();
        let mut sockets = Vec::with_capacity(n);
        for (host, port) in endpoints {
            let addr = format!("{host}:{port}");
            let stream = TcpStream::connect(&addr)
                .map_err(|e| XddError::Init(format!("connect to {addr} failed: {e}")))?;
            apply_socket_options(&stream, &self.control)?;
            sockets.push(Arc::new(Mutex::new(stream)));
        }
        let (tx, rx) = bounded(n);
        for i in 0..n {
            tx.send(i).expect("freshly created channel has capacity");
        }
        Ok(TcpConnection {
            sockets,
            free_sockets_tx: tx,
            free_sockets_rx: rx,
            inbound_rx: None,
            eof_sockets: Arc::new(AtomicUsize::new(0)),
            total_sockets: n,
            reader_handles: Mutex::new(Vec::new()),
        })
    }

    fn accept(&self, endpoints: &[(String, u16)]) -> Result<Self::Connection> {
        if endpoints.is_empty() {
            return Err(XddError::Config("accept called with an empty endpoint list".into()));
        }
        let n = endpoints.len();
        let mut listeners = Vec::with_capacity(n);
        for (host, port) in endpoints {
            let addr = format!("{host}:{port}");
            let listener = TcpListener::bind(&addr)
                .map_err(|e| XddError::Init(format!("bind {addr} failed: {e}")))?;
            listeners.push(listener);
        }
        let mut sockets = Vec::with_capacity(n);
        for listener in listeners {
            let (stream, _peer) = listener
                .accept()
                .map_err(|e| XddError::Init(format!("accept failed: {e}")))?;
            apply_socket_options(&stream, &self.control)?;
            sockets.push(Arc::new(Mutex::new(stream)));
        }
        let eof_sockets = Arc::new(AtomicUsize::new(0));
        let (inbound_tx, inbound_rx) = bounded(n * 4);
        let mut reader_handles = Vec::with_capacity(n);
        for socket in &sockets {
            reader_handles.push(Self::spawn_reader(
                socket.clone(),
                inbound_tx.clone(),
                eof_sockets.clone(),
                n,
            ));
        }
        let (free_tx, free_rx) = bounded(n);
        Ok(TcpConnection {
            sockets,
            free_sockets_tx: free_tx,
            free_sockets_rx: free_rx,
            inbound_rx: Some(inbound_rx),
            eof_sockets,
            total_sockets: n,
            reader_handles: Mutex::new(reader_handles),
        })
    }

    fn request_target_buffer(&self, _conn: &Self::Connection) -> Result<TargetBuffer> {
        let (ptr, size) = self.pool.take();
        // SAFETY: `ptr`/`size` were registered by the caller via
        // `register_buffer` and remain valid until returned via
        // `release_target_buffer` or after `send_target_buffer` returns.
        Ok(unsafe { TargetBuffer::from_raw_parts(ptr, size) })
    }

    fn send_target_buffer(&self, conn: &Self::Connection, buffer: TargetBuffer) -> Result<()> {
        let socket_idx = conn
            .free_sockets_rx
            .recv()
            .map_err(|_| XddError::Protocol("no free sockets to send on".into()))?;
        let header = WireHeader {
            sequence: buffer.sequence_number(),
            target_offset: buffer.target_offset(),
            data_length: buffer.data_length() as u32,
        };
        let result = (|| -> std::io::Result<()> {
            let mut stream =
                conn.sockets[socket_idx].lock().unwrap_or_else(|e| e.into_inner());
            stream.write_all(&header.encode())?;
            stream.write_all(buffer.data())?;
            Ok(())
        })();
        conn.free_sockets_tx
            .send(socket_idx)
            .expect("free-socket channel cannot be full: we just took this slot");
        let (ptr, size) = {
            let cap = buffer.capacity();
            // data() starts at the registered (post-reserved) pointer;
            // recover it by reconstructing from full_mut's base. Since
            // TargetBuffer does not expose the raw pointer publicly,
            // reuse capacity as the size and the data pointer directly.
            (buffer.data().as_ptr() as *mut u8, cap)
        };
        self.pool.give_back(ptr, size);
        result.map_err(|e| XddError::Io { target: "tcp transport".to_string(), source: e })
    }

    fn receive_target_buffer(
        &self,
        conn: &Self::Connection,
    ) -> std::result::Result<TargetBuffer, Eof> {
        let inbound_rx = conn.inbound_rx.as_ref().expect("receive called on a source connection");
        loop {
            if conn.eof_sockets.load(Ordering::SeqCst) >= conn.total_sockets {
                // Drain any remaining buffered messages before reporting
                // Eof, so in-flight data is not dropped.
                if let Ok(msg) = inbound_rx.try_recv() {
                    return Ok(self.message_into_buffer(msg));
                }
                return Err(Eof);
            }
            match inbound_rx.recv_timeout(std::time::Duration::from_millis(50)) {
                Ok(msg) => return Ok(self.message_into_buffer(msg)),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return Err(Eof),
            }
        }
    }

    fn release_target_buffer(&self, _conn: &Self::Connection, buffer: TargetBuffer) {
        let ptr = buffer.data().as_ptr() as *mut u8;
        self.pool.give_back(ptr, buffer.capacity());
    }

    fn close(&self, conn: Self::Connection) -> Result<()> {
        for socket in &conn.sockets {
            let stream = socket.lock().unwrap_or_else(|e| e.into_inner());
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        for handle in conn.reader_handles.into_inner().unwrap_or_else(|e| e.into_inner()) {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl TcpTransport {
    fn message_into_buffer(&self, msg: InboundMessage) -> TargetBuffer {
        let (ptr, size) = self.pool.take();
        // SAFETY: pool buffers are sized to fit the largest registered
        // transfer; `msg.payload.len()` was validated against the
        // negotiated transfer size at the E2E layer.
        let mut buffer = unsafe { TargetBuffer::from_raw_parts(ptr, size) };
        let n = msg.payload.len().min(size);
        buffer.full_mut()[..n].copy_from_slice(&msg.payload[..n]);
        buffer.set_data_length(n as u64);
        buffer.set_target_offset(msg.header.target_offset);
        buffer.set_sequence_number(msg.header.sequence);
        buffer
    }
}
