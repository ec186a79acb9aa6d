//! Thin owner of a kernel inotify instance: creates the fd, adds and
//! removes watches, and reads sized batches of raw records.
//!
//! The fd is opened non-blocking so the worker can register it with the
//! tokio reactor; `read_raw` surfaces `WouldBlock` untouched for the
//! reactor to re-arm on.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

/// `sizeof(struct inotify_event)` without the trailing name.
pub const EVENT_HEADER_LEN: usize = 16;

const DEFAULT_NUM_EVENTS: usize = 2048;

/// Default read size: room for a full batch of records with short names.
pub const DEFAULT_BUFFER_SIZE: usize = DEFAULT_NUM_EVENTS * (EVENT_HEADER_LEN + 16);

/// One record as read from the kernel, name NUL-stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub wd: i32,
    pub mask: u32,
    pub cookie: u32,
    pub name: Vec<u8>,
}

/// An inotify instance. Dropping closes the fd, which implicitly removes
/// every watch belonging to it.
#[derive(Debug)]
pub struct Inotify {
    fd: OwnedFd,
}

impl Inotify {
    /// Initializes an instance with `IN_CLOEXEC | IN_NONBLOCK`.
    pub fn init() -> io::Result<Inotify> {
        let fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC | libc::IN_NONBLOCK) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Inotify {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Adds (or fails with `EEXIST` under `IN_MASK_CREATE`) a watch and
    /// returns its descriptor.
    pub fn add_watch(&self, path: &Path, mask: u32) -> io::Result<i32> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let wd = unsafe {
            libc::inotify_add_watch(self.fd.as_raw_fd(), path.as_ptr(), mask)
        };
        if wd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(wd)
    }

    pub fn rm_watch(&self, wd: i32) -> io::Result<()> {
        let ret = unsafe { libc::inotify_rm_watch(self.fd.as_raw_fd(), wd) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Reads one batch of records into `buf` and parses them.
    ///
    /// `EINTR` is retried here; `EAGAIN` propagates as `WouldBlock` so the
    /// caller's readiness guard can re-arm. Any other error (notably
    /// `EBADF` after the fd was torn down) propagates as-is.
    pub fn read_raw(&self, buf: &mut [u8]) -> io::Result<Vec<RawEvent>> {
        let len = loop {
            let ret = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        };
        Ok(parse_event_buffer(&buf[..len]))
    }
}

impl AsRawFd for Inotify {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Walks the packed `(wd, mask, cookie, len, name[len])` records.
pub fn parse_event_buffer(buf: &[u8]) -> Vec<RawEvent> {
    let mut events = Vec::new();
    let mut i = 0;
    while i + EVENT_HEADER_LEN <= buf.len() {
        let wd = i32::from_ne_bytes(buf[i..i + 4].try_into().unwrap());
        let mask = u32::from_ne_bytes(buf[i + 4..i + 8].try_into().unwrap());
        let cookie = u32::from_ne_bytes(buf[i + 8..i + 12].try_into().unwrap());
        let len = u32::from_ne_bytes(buf[i + 12..i + 16].try_into().unwrap()) as usize;
        let start = i + EVENT_HEADER_LEN;
        if start + len > buf.len() {
            break;
        }
        let name = buf[start..start + len]
            .iter()
            .copied()
            .take_while(|&b| b != 0)
            .collect();
        events.push(RawEvent {
            wd,
            mask,
            cookie,
            name,
        });
        i = start + len;
    }
    events
}
