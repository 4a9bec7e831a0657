//! IB verbs transport (spec.md §4.5, §6 "IB implementation"): one
//! reliable-connected queue pair per registered buffer slot, credit-based
//! flow control so the sender never posts a send the receiver has no
//! buffer to land in.
//!
//! Wire framing is a 4-byte ASCII tag (`DATA`, `EOF `, or `CRED`). A
//! `DATA` tag is followed by an 8-byte big-endian target offset and the
//! payload, all within one registered send; a `CRED` tag is followed by
//! a 4-byte big-endian credit count and carries no payload. This is
//! independent of the 64-byte [`super::header::E2EHeader`] a worker
//! embeds inside the payload itself, same as the TCP transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use ibverbs::ibv_wc_status;

use super::{ControlBlock, Eof, TargetBuffer, Transport};
use crate::error::{Result, XddError};

const TAG_LEN: usize = 4;
const TAG_DATA: &[u8; TAG_LEN] = b"DATA";
const TAG_EOF: &[u8; TAG_LEN] = b"EOF ";
const TAG_CRED: &[u8; TAG_LEN] = b"CRED";
const OFFSET_LEN: usize = 8;
const CREDIT_LEN: usize = 4;

/// Registered memory region plus a free-list of same-sized slots, shared
/// between the credit accounting and the QP send/recv paths.
struct RegisteredPool {
    state: Mutex<VecDeque<(*mut u8, usize)>>,
    cond: Condvar,
}

// SAFETY: pointers are only ever handed out one at a time, under the
// mutex, and stay valid for the registering `IbTransport`'s lifetime.
unsafe impl Send for RegisteredPool {}
unsafe impl Sync for RegisteredPool {}

impl RegisteredPool {
    fn new() -> Self {
        Self { state: Mutex::new(VecDeque::new()), cond: Condvar::new() }
    }

    fn register(&self, ptr: *mut u8, size: usize) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.push_back((ptr, size));
        self.cond.notify_one();
    }

    fn take(&self) -> (*mut u8, usize) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while guard.is_empty() {
            guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        guard.pop_front().unwrap()
    }

    fn give_back(&self, ptr: *mut u8, size: usize) {
        self.register(ptr, size);
    }
}

/// One IB reliable-connected queue pair, bound to either a source or a
/// destination role. The queue pair and memory region themselves are
/// opaque to this module beyond what `ibverbs` exposes; connection
/// bring-up (address exchange, QP state transitions) happens out of band
/// through whatever rendezvous the caller provides the `endpoint` over
/// (spec.md leaves the out-of-band QP exchange channel unspecified; we
/// piggyback it on a short TCP handshake to the same `endpoint`, which is
/// how the reference implementation's IB path bootstraps its verbs
/// connection too).
pub struct IbConnection {
    qp: ibverbs::QueuePair,
    /// Local credits: how many receive buffers the peer has told us it
    /// has posted. A sender blocks in `send_target_buffer` until this is
    /// positive.
    send_credits: Arc<AtomicI64>,
    /// How many of our own posted receive buffers we have not yet told
    /// the peer about. Flushed as a `CRED` frame once it crosses a
    /// low-water mark.
    unannounced_recv_credits: Arc<AtomicI64>,
    eof_seen: Arc<std::sync::atomic::AtomicBool>,
    outstanding_recvs: Arc<AtomicUsize>,
}

pub struct IbTransport {
    control: ControlBlock,
    pool: Arc<RegisteredPool>,
    ctx: ibverbs::Context,
    pd: ibverbs::ProtectionDomain,
}

impl IbTransport {
    pub fn new(control: ControlBlock) -> Result<Self> {
        let devices = ibverbs::devices()
            .map_err(|e| XddError::Init(format!("failed to list IB devices: {e}")))?;
        let device = devices
            .iter()
            .next()
            .ok_or_else(|| XddError::Init("no IB devices available".into()))?;
        let ctx = device
            .open()
            .map_err(|e| XddError::Init(format!("failed to open IB device: {e}")))?;
        let pd = ctx
            .alloc_pd()
            .map_err(|e| XddError::Init(format!("failed to allocate protection domain: {e}")))?;
        Ok(Self { control, pool: Arc::new(RegisteredPool::new()), ctx, pd })
    }

    fn queue_depth(&self, fallback: usize) -> usize {
        self.control.socket_count.unwrap_or(fallback).max(1)
    }

    /// Out-of-band rendezvous: exchange queue pair identifiers over a
    /// plain TCP socket at `endpoint`, then transition the local QP
    /// RESET -> INIT -> RTR -> RTS. `is_server` picks accept vs connect
    /// for the rendezvous socket only; the IB side is symmetric once both
    /// QPs are RTS.
    fn bring_up_qp(&self, endpoint: &str, is_server: bool) -> Result<ibverbs::QueuePair> {
        use std::io::{Read, Write};
        use std::net::{TcpListener, TcpStream};

        let qp_builder = self
            .pd
            .create_qp(&self.ctx.create_cq(64, 0).map_err(|e| {
                XddError::Init(format!("failed to create completion queue: {e}"))
            })?, ibverbs::ibv_qp_type::IBV_QPT_RC)
            .build()
            .map_err(|e| XddError::Init(format!("failed to create queue pair: {e}")))?;
        let local_endpoint = qp_builder.endpoint();
        let local_bytes = local_endpoint.to_bytes();

        let peer_bytes = if is_server {
            let listener = TcpListener::bind(endpoint)
                .map_err(|e| XddError::Init(format!("bind {endpoint} for QP exchange failed: {e}")))?;
            let (mut stream, _peer) = listener
                .accept()
                .map_err(|e| XddError::Init(format!("accept for QP exchange failed: {e}")))?;
            let mut peer_bytes = vec![0u8; local_bytes.len()];
            stream
                .read_exact(&mut peer_bytes)
                .map_err(|e| XddError::Init(format!("QP exchange read failed: {e}")))?;
            stream
                .write_all(&local_bytes)
                .map_err(|e| XddError::Init(format!("QP exchange write failed: {e}")))?;
            peer_bytes
        } else {
            let mut stream = TcpStream::connect(endpoint)
                .map_err(|e| XddError::Init(format!("connect {endpoint} for QP exchange failed: {e}")))?;
            stream
                .write_all(&local_bytes)
                .map_err(|e| XddError::Init(format!("QP exchange write failed: {e}")))?;
            let mut peer_bytes = vec![0u8; local_bytes.len()];
            stream
                .read_exact(&mut peer_bytes)
                .map_err(|e| XddError::Init(format!("QP exchange read failed: {e}")))?;
            peer_bytes
        };
        let peer_endpoint = ibverbs::QueuePairEndpoint::from_bytes(&peer_bytes)
            .map_err(|e| XddError::Init(format!("malformed peer QP endpoint: {e}")))?;

        qp_builder
            .handshake(peer_endpoint)
            .map_err(|e| XddError::Init(format!("QP handshake failed: {e}")))
    }
}

impl Transport for IbTransport {
    type Connection = IbConnection;

    fn register_buffer(&self, data: *mut u8, size: usize, reserved: usize) {
        // SAFETY: caller guarantees `data` is valid for `size` bytes for
        // as long as it stays registered; the leading `reserved` bytes
        // are left to application framing, same contract as TCP.
        let usable_ptr = unsafe { data.add(reserved) };
        self.pool.register(usable_ptr, size - reserved);
    }

    fn connect(&self, endpoints: &[(String, u16)]) -> Result<Self::Connection> {
        let (host, port) = endpoints
            .first()
            .ok_or_else(|| XddError::Config("connect called with an empty endpoint list".into()))?;
        let endpoint = format!("{host}:{port}");
        let qp = self.bring_up_qp(&endpoint, false)?;
        let depth = self.queue_depth(1) as i64;
        Ok(IbConnection {
            qp,
            send_credits: Arc::new(AtomicI64::new(0)),
            unannounced_recv_credits: Arc::new(AtomicI64::new(0)),
            eof_seen: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            outstanding_recvs: Arc::new(AtomicUsize::new(depth as usize)),
        })
    }

    fn accept(&self, endpoints: &[(String, u16)]) -> Result<Self::Connection> {
        let (host, port) = endpoints
            .first()
            .ok_or_else(|| XddError::Config("accept called with an empty endpoint list".into()))?;
        let endpoint = format!("{host}:{port}");
        let qp = self.bring_up_qp(&endpoint, true)?;
        let depth = self.queue_depth(1) as i64;
        let conn = IbConnection {
            qp,
            send_credits: Arc::new(AtomicI64::new(0)),
            unannounced_recv_credits: Arc::new(AtomicI64::new(0)),
            eof_seen: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            outstanding_recvs: Arc::new(AtomicUsize::new(0)),
        };
        for _ in 0..depth {
            self.post_recv(&conn)?;
        }
        Ok(conn)
    }

    fn request_target_buffer(&self, _conn: &Self::Connection) -> Result<TargetBuffer> {
        let (ptr, size) = self.pool.take();
        // SAFETY: registered via `register_buffer` and valid until
        // returned through `release_target_buffer` or consumed by
        // `send_target_buffer`.
        Ok(unsafe { TargetBuffer::from_raw_parts(ptr, size) })
    }

    fn send_target_buffer(&self, conn: &Self::Connection, buffer: TargetBuffer) -> Result<()> {
        self.wait_for_send_credit(conn);
        let mut frame = Vec::with_capacity(TAG_LEN + OFFSET_LEN + buffer.data_length() as usize);
        frame.extend_from_slice(TAG_DATA);
        frame.extend_from_slice(&buffer.target_offset().to_be_bytes());
        frame.extend_from_slice(buffer.data());
        let result = self.post_send_raw(conn, &frame);
        let (ptr, size) = (buffer.data().as_ptr() as *mut u8, buffer.capacity());
        self.pool.give_back(ptr, size);
        result
    }

    fn receive_target_buffer(
        &self,
        conn: &Self::Connection,
    ) -> std::result::Result<TargetBuffer, Eof> {
        loop {
            if conn.eof_seen.load(Ordering::Acquire) {
                return Err(Eof);
            }
            let frame = self.poll_one(conn).map_err(|_| Eof)?;
            if frame.len() >= TAG_LEN && &frame[0..TAG_LEN] == TAG_CRED {
                let credit = i32::from_be_bytes(frame[TAG_LEN..TAG_LEN + CREDIT_LEN].try_into().unwrap());
                conn.send_credits.fetch_add(credit as i64, Ordering::AcqRel);
                self.replenish_recv(conn);
                continue;
            }
            if frame.len() >= TAG_LEN && &frame[0..TAG_LEN] == TAG_EOF {
                conn.eof_seen.store(true, Ordering::Release);
                return Err(Eof);
            }
            if frame.len() < TAG_LEN + OFFSET_LEN || &frame[0..TAG_LEN] != TAG_DATA {
                return Err(Eof);
            }
            let target_offset = u64::from_be_bytes(
                frame[TAG_LEN..TAG_LEN + OFFSET_LEN].try_into().unwrap(),
            );
            let payload = &frame[TAG_LEN + OFFSET_LEN..];
            let (ptr, size) = self.pool.take();
            // SAFETY: pool buffers are sized for the negotiated transfer
            // size; `payload.len()` was bounded by the sender's own
            // registered buffer, which matches ours by construction.
            let mut out = unsafe { TargetBuffer::from_raw_parts(ptr, size) };
            let n = payload.len().min(size);
            out.full_mut()[..n].copy_from_slice(&payload[..n]);
            out.set_data_length(n as u64);
            out.set_target_offset(target_offset);
            self.replenish_recv(conn);
            return Ok(out);
        }
    }

    fn release_target_buffer(&self, _conn: &Self::Connection, buffer: TargetBuffer) {
        let ptr = buffer.data().as_ptr() as *mut u8;
        self.pool.give_back(ptr, buffer.capacity());
    }

    fn close(&self, conn: Self::Connection) -> Result<()> {
        let _ = self.post_send_raw(&conn, TAG_EOF);
        Ok(())
    }
}

impl IbTransport {
    /// Blocks until the peer has told us (via a `CRED` frame) that it has
    /// at least one receive buffer posted for us.
    fn wait_for_send_credit(&self, conn: &IbConnection) {
        loop {
            let current = conn.send_credits.load(Ordering::Acquire);
            if current > 0
                && conn
                    .send_credits
                    .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Posts a receive-buffer credit announcement once unannounced
    /// credits cross a low-water mark, so the peer is not starved while
    /// we batch announcements.
    fn replenish_recv(&self, conn: &IbConnection) {
        conn.outstanding_recvs.fetch_sub(1, Ordering::AcqRel);
        let pending = conn.unannounced_recv_credits.fetch_add(1, Ordering::AcqRel) + 1;
        if pending >= 1 {
            conn.unannounced_recv_credits.store(0, Ordering::Release);
            let mut frame = Vec::with_capacity(TAG_LEN + CREDIT_LEN);
            frame.extend_from_slice(TAG_CRED);
            frame.extend_from_slice(&(pending as i32).to_be_bytes());
            let _ = self.post_send_raw(conn, &frame);
        }
        if let Err(e) = self.post_recv(conn) {
            tracing::warn!(error = %e, "failed to re-post IB receive buffer");
        }
    }

    fn post_recv(&self, conn: &IbConnection) -> Result<()> {
        let (ptr, size) = self.pool.take();
        // SAFETY: `ptr` is valid for `size` bytes and registered with the
        // same protection domain the queue pair was created under.
        let mr = unsafe {
            self.pd
                .register_raw(ptr, size)
                .map_err(|e| XddError::Init(format!("failed to register IB recv buffer: {e}")))?
        };
        unsafe {
            conn.qp
                .post_receive(&mr)
                .map_err(|e| XddError::Init(format!("post_receive failed: {e}")))?;
        }
        conn.outstanding_recvs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn post_send_raw(&self, conn: &IbConnection, frame: &[u8]) -> Result<()> {
        let (ptr, size) = self.pool.take();
        debug_assert!(frame.len() <= size, "frame must fit the negotiated buffer size");
        // SAFETY: `ptr` is valid for `size` bytes for the duration of the
        // send; we copy `frame` into it before posting.
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr(), ptr, frame.len());
            let mr = self
                .pd
                .register_raw(ptr, size)
                .map_err(|e| XddError::Init(format!("failed to register IB send buffer: {e}")))?;
            conn.qp
                .post_send(&mr, 0..frame.len())
                .map_err(|e| XddError::Init(format!("post_send failed: {e}")))?;
        }
        let outcome = self.poll_completion(conn);
        self.pool.give_back(ptr, size);
        outcome
    }

    fn poll_completion(&self, conn: &IbConnection) -> Result<()> {
        loop {
            match conn.qp.poll_send_completion() {
                Ok(Some(status)) if status == ibv_wc_status::IBV_WC_SUCCESS => return Ok(()),
                Ok(Some(status)) => {
                    return Err(XddError::Protocol(format!("IB send completion failed: {status:?}")))
                }
                Ok(None) => std::thread::yield_now(),
                Err(e) => return Err(XddError::Protocol(format!("IB completion poll failed: {e}"))),
            }
        }
    }

    /// Blocks until one receive completion arrives, returning the bytes
    /// actually written into the landed buffer.
    fn poll_one(&self, conn: &IbConnection) -> Result<Vec<u8>> {
        loop {
            match conn.qp.poll_recv_completion() {
                Ok(Some((buf, len))) => return Ok(buf[..len].to_vec()),
                Ok(None) => std::thread::yield_now(),
                Err(e) => return Err(XddError::Protocol(format!("IB recv poll failed: {e}"))),
            }
        }
    }
}
