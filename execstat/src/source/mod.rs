use crate::error::SourceError;

pub mod bpftool;
pub mod pinned;
mod sys;

pub use bpftool::BpftoolSource;
pub use pinned::{MapMeta, PinnedMap, PinnedMapSource};

/// One key/value pair as read from the map, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub key: u32,
    pub value: Vec<u8>,
}

/// Lazy sequence over one full pass of a map.
pub type Entries<'a> = Box<dyn Iterator<Item = Result<RawEntry, SourceError>> + 'a>;

/// A readable copy of the `execve` counter map.
///
/// Each call to [`MapSource::entries`] starts a fresh pass. Entry order is whatever the
/// backing table yields and carries no meaning.
pub trait MapSource {
    fn describe(&self) -> String;

    fn entries(&mut self) -> Result<Entries<'_>, SourceError>;
}

/// Interpret up to four little-endian key bytes as a `u32`.
pub(crate) fn key_from_bytes(bytes: &[u8]) -> u32 {
    let mut key = [0u8; 4];
    let len = bytes.len().min(4);
    key[..len].copy_from_slice(&bytes[..len]);
    u32::from_le_bytes(key)
}
