use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::notify::{self, Mode, Notifier, Wake};
use crate::scan;
use crate::tracker;

const READ_CHUNK: usize = 4096;
// Under kernel notification, re-stat every file at least this often so
// truncation and rotation on a quiet file are still noticed.
const STALE_SWEEP: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct FollowOptions {
    pub lines: u64,
    pub follow: bool,
    pub retry: bool,
    pub quiet: bool,
    pub verbose: bool,
    pub interval: Duration,
    pub force_poll: bool,
}

impl Default for FollowOptions {
    fn default() -> FollowOptions {
        FollowOptions {
            lines: 10,
            follow: false,
            retry: false,
            quiet: false,
            verbose: false,
            interval: Duration::from_millis(250),
            force_poll: false,
        }
    }
}

/// One watched input: display name, reopen path, the open handle (absent
/// while the file is inactive), the identity of that handle as last stat'ed
/// (`None` when a stat has never succeeded), and the byte offset already
/// delivered to output.
pub struct WatchedFile {
    pub name: String,
    pub path: PathBuf,
    pub file: Option<File>,
    pub snap: Option<tracker::Snapshot>,
    pub offset: u64,
    pub is_stdin: bool,
    pub seekable: bool,
    pub active: bool,
    pub reported: bool,
}

impl WatchedFile {
    pub fn from_path(path: &str) -> io::Result<WatchedFile> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        Ok(WatchedFile {
            name: path.to_string(),
            path: PathBuf::from(path),
            snap: tracker::snapshot_file(&file),
            file: Some(file),
            offset: 0,
            is_stdin: false,
            seekable: meta.file_type().is_file(),
            active: true,
            reported: false,
        })
    }

    /// A path that could not be opened yet; stays inactive until it appears.
    pub fn missing(path: &str) -> WatchedFile {
        WatchedFile {
            name: path.to_string(),
            path: PathBuf::from(path),
            file: None,
            snap: None,
            offset: 0,
            is_stdin: false,
            seekable: true,
            active: false,
            reported: false,
        }
    }

    pub fn stdin() -> io::Result<WatchedFile> {
        let fd = unsafe { libc::dup(libc::STDIN_FILENO) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(WatchedFile {
            name: "standard input".to_string(),
            path: PathBuf::new(),
            file: Some(file),
            snap: None,
            offset: 0,
            is_stdin: true,
            seekable: false,
            active: true,
            reported: false,
        })
    }
}

/// Decides when a `==> name <==` banner precedes emitted bytes: only with
/// multiple files (or verbose), and only when output switches files. Every
/// banner after the first is set off by a blank line.
pub struct OutputMux {
    banners: bool,
    last: Option<usize>,
}

impl OutputMux {
    pub fn new(file_count: usize, quiet: bool, verbose: bool) -> OutputMux {
        OutputMux {
            banners: !quiet && (verbose || file_count > 1),
            last: None,
        }
    }

    pub fn write(
        &mut self,
        idx: usize,
        name: &str,
        data: &[u8],
        out: &mut dyn Write,
    ) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.banners && self.last != Some(idx) {
            if self.last.is_some() {
                out.write_all(b"\n")?;
            }
            writeln!(out, "==> {} <==", name)?;
        }
        self.last = Some(idx);
        out.write_all(data)?;
        out.flush()
    }
}

pub struct FollowSession {
    files: Vec<WatchedFile>,
    mux: OutputMux,
    mode: Mode,
    backend: Box<dyn Notifier>,
    opts: FollowOptions,
}

impl FollowSession {
    pub fn new(files: Vec<WatchedFile>, opts: FollowOptions) -> FollowSession {
        let mux = OutputMux::new(files.len(), opts.quiet, opts.verbose);
        let (mode, backend) = if opts.follow {
            notify::select_backend(&files, &opts)
        } else {
            notify::poll_backend()
        };
        FollowSession {
            files,
            mux,
            mode,
            backend,
            opts,
        }
    }

    /// Emit the last `lines` of every input before any following starts.
    /// Seekable files are positioned by backward scan and drained; streams
    /// are consumed to end-of-file and then retired.
    pub fn seed(&mut self, out: &mut dyn Write) -> Result<()> {
        for idx in 0..self.files.len() {
            if !self.files[idx].active {
                continue;
            }
            if self.files[idx].seekable {
                let sought = {
                    let wf = &mut self.files[idx];
                    let Some(file) = wf.file.as_mut() else { continue };
                    scan::seek_last_lines(file, self.opts.lines)
                };
                match sought {
                    Ok(off) => {
                        self.files[idx].offset = off;
                        self.drain(idx, out)?;
                    }
                    Err(e) => {
                        let wf = &mut self.files[idx];
                        warn!("{}: cannot seed output: {e}", wf.name);
                        wf.active = false;
                    }
                }
            } else {
                let collected = {
                    let wf = &mut self.files[idx];
                    let Some(file) = wf.file.as_mut() else { continue };
                    scan::last_lines_stream(file, self.opts.lines)
                };
                match collected {
                    Ok(data) => {
                        self.mux.write(idx, &self.files[idx].name, &data, out)?;
                        let wf = &mut self.files[idx];
                        wf.offset = data.len() as u64;
                        // a stream read to end-of-file has nothing further
                        wf.active = false;
                    }
                    Err(e) => {
                        let wf = &mut self.files[idx];
                        warn!("{}: read error: {e}", wf.name);
                        wf.active = false;
                    }
                }
            }
        }
        Ok(())
    }

    /// The follow loop: suspend on the backend, then drain whichever files
    /// need it. Runs until the process is terminated by a signal.
    pub fn run(&mut self, out: &mut dyn Write) -> Result<()> {
        let mut last_sweep = Instant::now();
        loop {
            let timeout = match self.mode {
                Mode::Poll => self.opts.interval,
                Mode::KernelNotify => STALE_SWEEP,
            };
            match self.backend.wait(timeout) {
                Ok(Wake::Timeout) => {
                    self.sweep(out)?;
                    last_sweep = Instant::now();
                }
                Ok(Wake::Ready(idxs)) => {
                    for idx in idxs {
                        self.service(idx, out)?;
                    }
                    if last_sweep.elapsed() >= STALE_SWEEP {
                        self.sweep(out)?;
                        last_sweep = Instant::now();
                    }
                }
                Err(e) => match self.mode {
                    Mode::KernelNotify => {
                        debug!("notification wait failed ({e}); falling back to polling");
                        self.degrade();
                    }
                    Mode::Poll => return Err(e).context("wait failed"),
                },
            }
        }
    }

    fn sweep(&mut self, out: &mut dyn Write) -> Result<()> {
        for idx in 0..self.files.len() {
            self.service(idx, out)?;
        }
        Ok(())
    }

    /// One Idle-to-Idle pass for a single file: reappearance, rotation,
    /// truncation, then drain.
    fn service(&mut self, idx: usize, out: &mut dyn Write) -> Result<()> {
        if self.files[idx].is_stdin || !self.files[idx].seekable {
            // streams were fully consumed while seeding
            return Ok(());
        }
        if !self.files[idx].active {
            if self.opts.retry && self.mode == Mode::Poll {
                self.try_reappear(idx);
            }
            if !self.files[idx].active {
                return Ok(());
            }
        }
        if self.opts.retry {
            self.check_rotation(idx, out)?;
        }
        if !self.files[idx].active {
            return Ok(());
        }
        self.check_truncation(idx);
        self.drain(idx, out)
    }

    fn check_truncation(&mut self, idx: usize) {
        let wf = &mut self.files[idx];
        let Some(file) = wf.file.as_mut() else { return };
        let Some(cur) = tracker::snapshot_file(file) else {
            return;
        };
        if !tracker::has_shrunk(wf.offset, cur.size) {
            return;
        }
        warn!("{}: file truncated", wf.name);
        match file.seek(SeekFrom::End(0)) {
            Ok(pos) => wf.offset = pos,
            Err(e) => {
                if !wf.reported {
                    warn!("{}: seek error: {e}", wf.name);
                    wf.reported = true;
                }
                wf.active = false;
            }
        }
    }

    fn check_rotation(&mut self, idx: usize, out: &mut dyn Write) -> Result<()> {
        let rotated = {
            let wf = &self.files[idx];
            match wf.file.as_ref() {
                None => return Ok(()),
                Some(file) => match tracker::snapshot_file(file) {
                    Some(open) => {
                        tracker::has_rotated(&open, tracker::snapshot_path(&wf.path).as_ref())
                    }
                    None => true,
                },
            }
        };
        if !rotated {
            return Ok(());
        }
        // deliver whatever the old handle still holds before letting go
        self.drain(idx, out)?;
        let reopened = File::open(&self.files[idx].path);
        let wf = &mut self.files[idx];
        match reopened {
            Ok(nf) => {
                warn!("{}: has been replaced; following new file", wf.name);
                wf.snap = tracker::snapshot_file(&nf);
                wf.offset = 0;
                wf.file = Some(nf);
                wf.active = true;
                wf.reported = false;
                if self.mode == Mode::KernelNotify {
                    self.backend.unregister(idx);
                    if let Err(e) = self.backend.register(idx, &self.files[idx]) {
                        debug!(
                            "{}: {e}; falling back to polling",
                            self.files[idx].name
                        );
                        self.degrade();
                    }
                }
            }
            Err(e) => {
                if !wf.reported {
                    warn!("{}: has become inaccessible: {e}", wf.name);
                    wf.reported = true;
                }
                wf.file = None;
                wf.active = false;
                if self.mode == Mode::KernelNotify {
                    self.backend.unregister(idx);
                }
            }
        }
        Ok(())
    }

    /// Polling mode only: an inactive entry comes back once the path names a
    /// different file than the one that went away.
    fn try_reappear(&mut self, idx: usize) {
        let wf = &mut self.files[idx];
        let Some(disk) = tracker::snapshot_path(&wf.path) else {
            return;
        };
        if let Some(old) = wf.snap {
            if disk.ino == old.ino && disk.dev == old.dev {
                return;
            }
        }
        match File::open(&wf.path) {
            Ok(nf) => {
                let regular = nf.metadata().map(|m| m.file_type().is_file()).unwrap_or(false);
                if !regular {
                    debug!("{}: reappeared as a non-regular file; not following", wf.name);
                    return;
                }
                warn!("{}: has appeared; following new file", wf.name);
                wf.snap = tracker::snapshot_file(&nf);
                wf.offset = 0;
                wf.file = Some(nf);
                wf.active = true;
                wf.reported = false;
            }
            Err(_) => {}
        }
    }

    /// Copy everything currently available from the file to the output.
    /// "Nothing pending right now" (a zero read) ends the pass; it is not a
    /// terminal end-of-file for a followed file.
    fn drain(&mut self, idx: usize, out: &mut dyn Write) -> Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = {
                let wf = &mut self.files[idx];
                let Some(file) = wf.file.as_mut() else {
                    return Ok(());
                };
                match file.read(&mut buf) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if !wf.reported {
                            warn!("{}: read error: {e}", wf.name);
                            wf.reported = true;
                        }
                        wf.active = false;
                        return Ok(());
                    }
                }
            };
            if n == 0 {
                break;
            }
            self.mux.write(idx, &self.files[idx].name, &buf[..n], out)?;
            self.files[idx].offset += n as u64;
        }
        Ok(())
    }

    fn degrade(&mut self) {
        let (mode, backend) = notify::poll_backend();
        self.mode = mode;
        self.backend = backend;
    }
}
