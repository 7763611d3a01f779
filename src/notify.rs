use std::io;
use std::path::Path;
use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::follow::{FollowOptions, WatchedFile};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("change notification is not supported on this platform")]
    Unsupported,
    #[error("watch registration failed: {0}")]
    Register(#[source] io::Error),
    #[error("notification wait failed: {0}")]
    Wait(#[source] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    KernelNotify,
    Poll,
}

/// Outcome of one suspension: either the interval elapsed (service every
/// file) or the kernel flagged specific files as changed.
#[derive(Debug)]
pub enum Wake {
    Timeout,
    Ready(Vec<usize>),
}

pub trait Notifier {
    fn register(&mut self, idx: usize, file: &WatchedFile) -> Result<(), NotifyError>;
    fn unregister(&mut self, idx: usize);
    fn wait(&mut self, timeout: Duration) -> Result<Wake, NotifyError>;
}

/// Timed-tick fallback: no kernel resources, just suspend for the interval.
/// The follow loop re-stats and drains every file on each tick.
pub struct PollBackend;

impl Notifier for PollBackend {
    fn register(&mut self, _idx: usize, _file: &WatchedFile) -> Result<(), NotifyError> {
        Ok(())
    }

    fn unregister(&mut self, _idx: usize) {}

    fn wait(&mut self, timeout: Duration) -> Result<Wake, NotifyError> {
        std::thread::sleep(timeout);
        Ok(Wake::Timeout)
    }
}

pub fn poll_backend() -> (Mode, Box<dyn Notifier>) {
    (Mode::Poll, Box::new(PollBackend))
}

/// Decide the session's backend once, at startup. Kernel notification is
/// only worth registering when every watched file is a present, seekable
/// file on a local filesystem; anything else (stdin, missing files awaiting
/// appearance, network mounts, an explicit override, or a registration
/// failure) selects the polling tick for the whole session.
pub fn select_backend(files: &[WatchedFile], opts: &FollowOptions) -> (Mode, Box<dyn Notifier>) {
    if opts.force_poll {
        debug!("polling forced by option");
        return poll_backend();
    }
    if files.iter().any(|f| f.is_stdin || !f.seekable) {
        debug!("non-seekable input watched; using polling");
        return poll_backend();
    }
    if files.iter().any(|f| !f.active) {
        debug!("watched file absent at start; using polling");
        return poll_backend();
    }
    if let Some(f) = files.iter().find(|f| !is_local_filesystem(&f.path)) {
        debug!("{}: not on a local filesystem; using polling", f.name);
        return poll_backend();
    }
    let mut backend = match KernelBackend::new(opts.retry) {
        Ok(b) => b,
        Err(e) => {
            debug!("kernel notification unavailable ({e}); using polling");
            return poll_backend();
        }
    };
    for (idx, f) in files.iter().enumerate() {
        if let Err(e) = backend.register(idx, f) {
            debug!("{}: {e}; using polling", f.name);
            return poll_backend();
        }
    }
    (Mode::KernelNotify, Box::new(backend))
}

fn timeout_millis(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

#[cfg(target_os = "linux")]
fn is_local_filesystem(path: &Path) -> bool {
    use nix::sys::statfs::{
        statfs, CODA_SUPER_MAGIC, NCP_SUPER_MAGIC, NFS_SUPER_MAGIC, SMB_SUPER_MAGIC,
    };
    match statfs(path) {
        Ok(fs) => {
            let t = fs.filesystem_type();
            t != NFS_SUPER_MAGIC
                && t != SMB_SUPER_MAGIC
                && t != CODA_SUPER_MAGIC
                && t != NCP_SUPER_MAGIC
        }
        Err(_) => false,
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn is_local_filesystem(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let mut st: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(cpath.as_ptr(), &mut st) };
    rc == 0 && (st.f_flags as u64) & (libc::MNT_LOCAL as u64) != 0
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn is_local_filesystem(_path: &Path) -> bool {
    false
}

// Linux: one inotify instance, one watch per followed path. Appends arrive
// as IN_MODIFY; with rotation tracking the move/delete of the watched path
// itself wakes the loop so it can re-stat immediately.
#[cfg(target_os = "linux")]
pub struct KernelBackend {
    fd: libc::c_int,
    retry: bool,
    wd_by_idx: std::collections::HashMap<usize, libc::c_int>,
    idx_by_wd: std::collections::HashMap<libc::c_int, usize>,
}

#[cfg(target_os = "linux")]
impl KernelBackend {
    pub fn new(retry: bool) -> Result<Self, NotifyError> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(NotifyError::Register(io::Error::last_os_error()));
        }
        Ok(KernelBackend {
            fd,
            retry,
            wd_by_idx: std::collections::HashMap::new(),
            idx_by_wd: std::collections::HashMap::new(),
        })
    }

    fn drain_events(&self, ready: &mut Vec<usize>) -> Result<(), NotifyError> {
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(NotifyError::Wait(err)),
                }
            }
            if n == 0 {
                break;
            }
            let n = n as usize;
            let mut off = 0;
            while off + std::mem::size_of::<libc::inotify_event>() <= n {
                let ev = unsafe {
                    std::ptr::read_unaligned(buf.as_ptr().add(off) as *const libc::inotify_event)
                };
                off += std::mem::size_of::<libc::inotify_event>() + ev.len as usize;
                if let Some(&idx) = self.idx_by_wd.get(&ev.wd) {
                    ready.push(idx);
                }
            }
            if n < buf.len() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Notifier for KernelBackend {
    fn register(&mut self, idx: usize, file: &WatchedFile) -> Result<(), NotifyError> {
        use std::os::unix::ffi::OsStrExt;
        let cpath = std::ffi::CString::new(file.path.as_os_str().as_bytes())
            .map_err(|_| NotifyError::Register(io::Error::from(io::ErrorKind::InvalidInput)))?;
        let mut mask = libc::IN_MODIFY | libc::IN_ATTRIB;
        if self.retry {
            mask |= libc::IN_MOVE_SELF | libc::IN_DELETE_SELF;
        }
        let wd = unsafe { libc::inotify_add_watch(self.fd, cpath.as_ptr(), mask) };
        if wd < 0 {
            return Err(NotifyError::Register(io::Error::last_os_error()));
        }
        self.wd_by_idx.insert(idx, wd);
        self.idx_by_wd.insert(wd, idx);
        Ok(())
    }

    fn unregister(&mut self, idx: usize) {
        if let Some(wd) = self.wd_by_idx.remove(&idx) {
            self.idx_by_wd.remove(&wd);
            unsafe { libc::inotify_rm_watch(self.fd, wd) };
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<Wake, NotifyError> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_millis(timeout)) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Wake::Timeout);
            }
            return Err(NotifyError::Wait(err));
        }
        if rc == 0 {
            return Ok(Wake::Timeout);
        }
        let mut ready = Vec::new();
        self.drain_events(&mut ready)?;
        if ready.is_empty() {
            return Ok(Wake::Timeout);
        }
        ready.sort_unstable();
        ready.dedup();
        Ok(Wake::Ready(ready))
    }
}

#[cfg(target_os = "linux")]
impl Drop for KernelBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

// BSD family: kqueue with EVFILT_READ per descriptor, plus EVFILT_VNODE for
// delete/rename when rotation tracking is on. Closing a descriptor removes
// its filters, so unregister only has to forget the mapping.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub struct KernelBackend {
    kq: libc::c_int,
    retry: bool,
    fd_by_idx: std::collections::HashMap<usize, libc::c_int>,
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
impl KernelBackend {
    pub fn new(retry: bool) -> Result<Self, NotifyError> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(NotifyError::Register(io::Error::last_os_error()));
        }
        Ok(KernelBackend {
            kq,
            retry,
            fd_by_idx: std::collections::HashMap::new(),
        })
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
impl Notifier for KernelBackend {
    fn register(&mut self, idx: usize, file: &WatchedFile) -> Result<(), NotifyError> {
        use std::os::unix::io::AsRawFd;
        let fd = match file.file.as_ref() {
            Some(f) => f.as_raw_fd(),
            None => return Err(NotifyError::Register(io::Error::from(io::ErrorKind::NotFound))),
        };
        let mut changes = vec![libc::kevent {
            ident: fd as libc::uintptr_t,
            filter: libc::EVFILT_READ,
            flags: libc::EV_ADD | libc::EV_CLEAR,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        }];
        if self.retry {
            changes.push(libc::kevent {
                ident: fd as libc::uintptr_t,
                filter: libc::EVFILT_VNODE,
                flags: libc::EV_ADD | libc::EV_CLEAR,
                fflags: libc::NOTE_DELETE | libc::NOTE_RENAME,
                data: 0,
                udata: std::ptr::null_mut(),
            });
        }
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as libc::c_int,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(NotifyError::Register(io::Error::last_os_error()));
        }
        self.fd_by_idx.insert(idx, fd);
        Ok(())
    }

    fn unregister(&mut self, idx: usize) {
        self.fd_by_idx.remove(&idx);
    }

    fn wait(&mut self, timeout: Duration) -> Result<Wake, NotifyError> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let mut events: [libc::kevent; 8] = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                &ts,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Wake::Timeout);
            }
            return Err(NotifyError::Wait(err));
        }
        if rc == 0 {
            return Ok(Wake::Timeout);
        }
        let mut ready = Vec::new();
        for ev in events.iter().take(rc as usize) {
            let fd = ev.ident as libc::c_int;
            if let Some((&idx, _)) = self.fd_by_idx.iter().find(|(_, &v)| v == fd) {
                ready.push(idx);
            }
        }
        if ready.is_empty() {
            return Ok(Wake::Timeout);
        }
        ready.sort_unstable();
        ready.dedup();
        Ok(Wake::Ready(ready))
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
impl Drop for KernelBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub struct KernelBackend;

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
impl KernelBackend {
    pub fn new(_retry: bool) -> Result<Self, NotifyError> {
        Err(NotifyError::Unsupported)
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
impl Notifier for KernelBackend {
    fn register(&mut self, _idx: usize, _file: &WatchedFile) -> Result<(), NotifyError> {
        Err(NotifyError::Unsupported)
    }

    fn unregister(&mut self, _idx: usize) {}

    fn wait(&mut self, _timeout: Duration) -> Result<Wake, NotifyError> {
        Err(NotifyError::Unsupported)
    }
}
