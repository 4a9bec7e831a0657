//! Pluggable target backend (spec.md §9 "platform #ifdef fan-out":
//! "collapse all OS-specific open, preallocate, and lock-memory branches
//! into a single trait whose implementations are selected at build time;
//! keep the Linux path as the reference").

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::error::{Result, XddError};

/// The six backend kinds named in spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    File,
    BlockDev,
    CharDev,
    Socket,
    Null,
    Sg,
}

/// Stat info recorded at open time, used to classify the file type and
/// decide whether direct I/O / preallocation are even meaningful.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetStat {
    pub size: u64,
    pub is_regular_file: bool,
}

/// Outcome of a preallocate attempt, recorded for diagnostics (spec.md
/// §10 supplement: "preallocate/pretruncate split").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreallocateOutcome {
    Reserved,
    Pretruncated,
    Skipped,
}

/// A backend's open handle plus the read/write/sync/preallocate
/// operations a worker needs (spec.md §4.6 step 5, §4.7 "Initialization").
pub trait TargetBackend: Send {
    fn stat(&self) -> TargetStat;

    /// Read `length` bytes at `offset` into `buf[..length]`. Returns the
    /// number of bytes actually read; `0` with no error is a clean EOF
    /// (spec.md §4.6 step 5).
    fn read_at(&mut self, offset: u64, buf: &mut [u8], length: usize) -> Result<usize>;

    /// Write `buf[..length]` at `offset`. Any return value less than
    /// `length` is an error (spec.md §4.6 step 5).
    fn write_at(&mut self, offset: u64, buf: &[u8], length: usize) -> Result<usize>;

    /// `fdatasync`-equivalent; invoked when sync-after-write is
    /// configured (spec.md §4.7 step 7).
    fn sync(&mut self) -> Result<()>;

    /// Attempt to reserve `bytes` of space ahead of time (spec.md §4.7
    /// "Initialization", §10 supplement). Best-effort: failure downgrades
    /// to `Skipped` rather than aborting the target.
    fn preallocate(&mut self, bytes: u64) -> PreallocateOutcome;

    /// Reopen the backend without direct I/O, used when an operation's
    /// offset or length is not page-aligned (spec.md §4.6 step 4). A
    /// no-op for backends that never opened with direct I/O.
    fn disable_direct_io(&mut self) -> Result<()>;
}

/// Options that shape how a backend opens its target, derived from
/// `rwratio` and the target's options (spec.md §4.7 "Initialization":
/// "Open the target (calling the OS backend with flags derived from
/// `rwratio` and options)").
#[derive(Debug, Clone)]
pub struct OpenOptionsSpec {
    pub kind: BackendKind,
    pub path: String,
    pub read: bool,
    pub write: bool,
    pub direct_io: bool,
    pub create: bool,
}

/// Reference Linux implementation, backing `{file, blockdev, chardev}`
/// targets with a plain `std::fs::File`. `direct_io` uses `O_DIRECT`
/// where the platform supports it; `Null`/`Socket`/`Sg` targets are the
/// concern of dedicated, simpler backends layered on top of this module
/// (a socket target has no local file to open, a null target discards
/// writes and reads zeros).
pub struct LinuxFileBackend {
    file: File,
    direct_io: bool,
    path: String,
    stat: TargetStat,
}

impl LinuxFileBackend {
    pub fn open(spec: &OpenOptionsSpec) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(spec.read).write(spec.write).create(spec.create);
        if spec.direct_io {
            #[cfg(target_os = "linux")]
            {
                options.custom_flags(libc::O_DIRECT);
            }
        }
        let file = options
            .open(&spec.path)
            .map_err(|e| XddError::Init(format!("open {} failed: {e}", spec.path)))?;
        let metadata = file
            .metadata()
            .map_err(|e| XddError::Init(format!("stat {} failed: {e}", spec.path)))?;
        let stat = TargetStat { size: metadata.len(), is_regular_file: metadata.is_file() };
        Ok(Self { file, direct_io: spec.direct_io, path: spec.path.clone(), stat })
    }

    pub fn is_direct_io(&self) -> bool {
        self.direct_io
    }
}

impl TargetBackend for LinuxFileBackend {
    fn stat(&self) -> TargetStat {
        self.stat
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8], length: usize) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| XddError::Io { target: self.path.clone(), source: e })?;
        let mut total = 0;
        while total < length {
            match self.file.read(&mut buf[total..length]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => return Err(XddError::Io { target: self.path.clone(), source: e }),
            }
        }
        Ok(total)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8], length: usize) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| XddError::Io { target: self.path.clone(), source: e })?;
        self.file
            .write_all(&buf[..length])
            .map_err(|e| XddError::Io { target: self.path.clone(), source: e })?;
        Ok(length)
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data().map_err(|e| XddError::Io { target: self.path.clone(), source: e })
    }

    fn preallocate(&mut self, bytes: u64) -> PreallocateOutcome {
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: `fd` is valid for the lifetime of this call; `mode
            // = 0` requests a plain reservation (no hole-punching).
            let rc = unsafe {
                libc::fallocate(self.file.as_raw_fd(), 0, 0, bytes as libc::off_t)
            };
            if rc == 0 {
                return PreallocateOutcome::Reserved;
            }
            tracing::warn!(path = %self.path, "fallocate failed, falling back to pretruncate");
        }
        match self.file.set_len(bytes) {
            Ok(()) => PreallocateOutcome::Pretruncated,
            Err(e) => {
                tracing::warn!(path = %self.path, error = %e, "pretruncate failed, skipping preallocation");
                PreallocateOutcome::Skipped
            }
        }
    }

    fn disable_direct_io(&mut self) -> Result<()> {
        if !self.direct_io {
            return Ok(());
        }
        let spec = OpenOptionsSpec {
            kind: BackendKind::File,
            path: self.path.clone(),
            read: true,
            write: true,
            direct_io: false,
            create: false,
        };
        let reopened = Self::open(&spec)?;
        *self = reopened;
        tracing::warn!(path = %self.path, "direct I/O disabled for remainder of pass: misaligned offset/length");
        Ok(())
    }
}

/// A target that discards writes and yields zeroed reads, used for
/// timing-harness measurements (spec.md §3 backend kind `null`).
pub struct NullBackend {
    size: u64,
}

impl NullBackend {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

impl TargetBackend for NullBackend {
    fn stat(&self) -> TargetStat {
        TargetStat { size: self.size, is_regular_file: false }
    }

    fn read_at(&mut self, _offset: u64, buf: &mut [u8], length: usize) -> Result<usize> {
        buf[..length].fill(0);
        Ok(length)
    }

    fn write_at(&mut self, _offset: u64, _buf: &[u8], length: usize) -> Result<usize> {
        Ok(length)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn preallocate(&mut self, _bytes: u64) -> PreallocateOutcome {
        PreallocateOutcome::Skipped
    }

    fn disable_direct_io(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn open_backend(spec: &OpenOptionsSpec) -> Result<Box<dyn TargetBackend>> {
    match spec.kind {
        BackendKind::Null => Ok(Box::new(NullBackend::new(0))),
        BackendKind::File | BackendKind::BlockDev | BackendKind::CharDev | BackendKind::Sg => {
            Ok(Box::new(LinuxFileBackend::open(spec)?))
        }
        BackendKind::Socket => Err(XddError::Init(
            "socket-backed targets are opened by the transport, not TargetBackend::open".into(),
        )),
    }
}

pub fn path_exists(path: &str) -> bool {
    Path::new(path).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn file_backend_round_trips_write_then_read() {
        let tmp = NamedTempFile::new().unwrap();
        let spec = OpenOptionsSpec {
            kind: BackendKind::File,
            path: tmp.path().to_str().unwrap().to_string(),
            read: true,
            write: true,
            direct_io: false,
            create: false,
        };
        let mut backend = LinuxFileBackend::open(&spec).unwrap();
        let data = vec![0xAB; 4096];
        let written = backend.write_at(0, &data, data.len()).unwrap();
        assert_eq!(written, 4096);
        let mut readback = vec![0u8; 4096];
        let read = backend.read_at(0, &mut readback, 4096).unwrap();
        assert_eq!(read, 4096);
        assert_eq!(readback, data);
    }

    #[test]
    fn file_backend_reports_short_read_as_eof() {
        let tmp = NamedTempFile::new().unwrap();
        let spec = OpenOptionsSpec {
            kind: BackendKind::File,
            path: tmp.path().to_str().unwrap().to_string(),
            read: true,
            write: true,
            direct_io: false,
            create: false,
        };
        let mut backend = LinuxFileBackend::open(&spec).unwrap();
        backend.write_at(0, &[1, 2, 3, 4], 4).unwrap();
        let mut buf = vec![0u8; 16];
        let read = backend.read_at(0, &mut buf, 16).unwrap();
        assert_eq!(read, 4, "short read must be reported, not padded");
    }

    #[test]
    fn preallocate_falls_back_to_pretruncate_when_fallocate_unavailable() {
        let tmp = NamedTempFile::new().unwrap();
        let spec = OpenOptionsSpec {
            kind: BackendKind::File,
            path: tmp.path().to_str().unwrap().to_string(),
            read: true,
            write: true,
            direct_io: false,
            create: false,
        };
        let mut backend = LinuxFileBackend::open(&spec).unwrap();
        let outcome = backend.preallocate(8192);
        assert!(matches!(outcome, PreallocateOutcome::Reserved | PreallocateOutcome::Pretruncated));
        assert!(backend.stat.size <= 8192); // stat snapshot predates preallocate; not re-read here
    }

    #[test]
    fn null_backend_reads_zeros_and_discards_writes() {
        let mut backend = NullBackend::new(0);
        let mut buf = vec![0xFFu8; 64];
        backend.read_at(0, &mut buf, 64).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(backend.write_at(0, &[1, 2, 3], 3).unwrap(), 3);
    }
}
