use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::sys::stat::{fstat, stat};

/// Identity and size of a file as last observed. Two snapshots with the same
/// device and inode refer to the same file regardless of path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub size: u64,
}

impl Snapshot {
    fn from_stat(st: nix::sys::stat::FileStat) -> Snapshot {
        Snapshot {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            nlink: st.st_nlink as u64,
            size: if st.st_size < 0 { 0 } else { st.st_size as u64 },
        }
    }
}

/// Stat a path. `None` means the file is temporarily unavailable (gone,
/// permission change, ...); callers skip the file until it comes back.
pub fn snapshot_path(path: &Path) -> Option<Snapshot> {
    stat(path).ok().map(Snapshot::from_stat)
}

/// Stat an open handle. Keeps working after the path is unlinked, which is
/// what exposes the link count dropping to zero.
pub fn snapshot_file(file: &File) -> Option<Snapshot> {
    fstat(file.as_raw_fd()).ok().map(Snapshot::from_stat)
}

/// The path no longer names the file behind `open`: the on-disk entry has a
/// different inode or device, the path vanished entirely, or the open file
/// was unlinked (nlink reached 0).
pub fn has_rotated(open: &Snapshot, on_disk: Option<&Snapshot>) -> bool {
    if open.nlink == 0 {
        return true;
    }
    match on_disk {
        Some(d) => d.ino != open.ino || d.dev != open.dev,
        None => true,
    }
}

/// The file now ends before bytes we already emitted.
pub fn has_shrunk(offset: u64, size: u64) -> bool {
    size < offset
}
