#![no_std]

//! Value layout of the pinned `execve` counter map.
//!
//! The kernel program writes one `proc_info` per key:
//!
//! ```text
//! offset  size  field
//!      0    16  comm (NUL-padded)
//!     16     4  pid   (little-endian)
//!     20     8  count (little-endian)
//! ```
//!
//! Fields are read at these fixed offsets rather than through a `#[repr(C)]` cast, since
//! the layout is owned by the kernel side and is packed.

pub const TASK_COMM_LEN: usize = 16;

pub const COMM_OFFSET: usize = 0;
pub const PID_OFFSET: usize = COMM_OFFSET + TASK_COMM_LEN;
pub const COUNT_OFFSET: usize = PID_OFFSET + 4;

/// Size in bytes of one encoded value.
pub const PROC_INFO_SIZE: usize = COUNT_OFFSET + 8;

/// Size in bytes of a map key (`u32`).
pub const KEY_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcInfo {
    pub comm: [u8; TASK_COMM_LEN],
    pub pid: u32,
    pub count: u64,
}

impl ProcInfo {
    /// Decode the leading `PROC_INFO_SIZE` bytes of `buf`.
    ///
    /// Returns `None` when `buf` is too short. Bytes past `PROC_INFO_SIZE` are ignored.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < PROC_INFO_SIZE {
            return None;
        }

        let mut comm = [0u8; TASK_COMM_LEN];
        comm.copy_from_slice(&buf[COMM_OFFSET..PID_OFFSET]);

        let mut pid = [0u8; 4];
        pid.copy_from_slice(&buf[PID_OFFSET..COUNT_OFFSET]);

        let mut count = [0u8; 8];
        count.copy_from_slice(&buf[COUNT_OFFSET..PROC_INFO_SIZE]);

        Some(Self {
            comm,
            pid: u32::from_le_bytes(pid),
            count: u64::from_le_bytes(count),
        })
    }

    pub fn to_bytes(&self) -> [u8; PROC_INFO_SIZE] {
        let mut buf = [0u8; PROC_INFO_SIZE];
        buf[COMM_OFFSET..PID_OFFSET].copy_from_slice(&self.comm);
        buf[PID_OFFSET..COUNT_OFFSET].copy_from_slice(&self.pid.to_le_bytes());
        buf[COUNT_OFFSET..PROC_INFO_SIZE].copy_from_slice(&self.count.to_le_bytes());
        buf
    }

    /// Build a value from a process name, truncating it to `TASK_COMM_LEN` bytes.
    pub fn new(name: &[u8], pid: u32, count: u64) -> Self {
        let mut comm = [0u8; TASK_COMM_LEN];
        let len = name.len().min(TASK_COMM_LEN);
        comm[..len].copy_from_slice(&name[..len]);
        Self { comm, pid, count }
    }

    /// The comm bytes up to (not including) the first NUL.
    pub fn comm_bytes(&self) -> &[u8] {
        comm_bytes(&self.comm)
    }
}

/// Slice `buf` (at most `TASK_COMM_LEN` bytes of it) up to the first NUL.
pub fn comm_bytes(buf: &[u8]) -> &[u8] {
    let buf = &buf[..buf.len().min(TASK_COMM_LEN)];
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}
