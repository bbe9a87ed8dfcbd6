use std::collections::HashSet;
use std::io;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use aya::maps::MapData;
use log::{debug, warn};

use crate::error::SourceError;
use crate::source::{Entries, MapSource, RawEntry, key_from_bytes, sys};

/// Map metadata reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapMeta {
    pub name: String,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
}

/// An opened pinned map.
pub struct PinnedMap {
    path: PathBuf,
    data: MapData,
    meta: MapMeta,
}

impl PinnedMap {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |source| SourceError::MapUnavailable {
            path: path.clone(),
            source,
        };

        let data = MapData::from_pin(&path).map_err(unavailable)?;
        let info = data.info().map_err(unavailable)?;
        let meta = MapMeta {
            name: info.name_as_str().unwrap_or_default().to_string(),
            key_size: info.key_size(),
            value_size: info.value_size(),
            max_entries: info.max_entries(),
        };
        debug!("Opened pinned map {} ({:?})", path.display(), meta);

        Ok(Self { path, data, meta })
    }

    pub fn meta(&self) -> &MapMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk the map once, reading raw values of `value_size` bytes.
    pub fn iter(&self) -> PinnedMapIter<'_> {
        PinnedMapIter {
            walk: KeyWalk::new(&self.data, &self.path, &self.meta),
        }
    }
}

/// Element access used by the key walk.
pub(crate) trait KeyTable {
    /// Write the key after `key` into `next_key` (`None` for the first key). `Ok(false)` at
    /// the end of the table.
    fn next_key(&self, key: Option<&[u8]>, next_key: &mut [u8]) -> io::Result<bool>;

    /// Copy the value under `key` into `value`. `Ok(false)` when the key is gone.
    fn lookup(&self, key: &[u8], value: &mut [u8]) -> io::Result<bool>;
}

impl KeyTable for MapData {
    fn next_key(&self, key: Option<&[u8]>, next_key: &mut [u8]) -> io::Result<bool> {
        sys::get_next_key(self.fd().as_fd(), key, next_key)
    }

    fn lookup(&self, key: &[u8], value: &mut [u8]) -> io::Result<bool> {
        sys::lookup_elem(self.fd().as_fd(), key, value)
    }
}

/// One pass over a table, yielding each live key at most once.
struct KeyWalk<'a, T: KeyTable> {
    table: &'a T,
    path: &'a Path,
    key_size: usize,
    value_size: usize,
    limit: u64,
    /// Last key that was found live; the walk continues from here.
    cursor: Option<Vec<u8>>,
    seen: HashSet<Vec<u8>>,
    visited: u64,
    done: bool,
}

impl<'a, T: KeyTable> KeyWalk<'a, T> {
    fn new(table: &'a T, path: &'a Path, meta: &MapMeta) -> Self {
        Self {
            table,
            path,
            key_size: meta.key_size as usize,
            value_size: meta.value_size as usize,
            limit: 2 * u64::from(meta.max_entries),
            cursor: None,
            seen: HashSet::new(),
            visited: 0,
            done: false,
        }
    }

    fn fail(&mut self, source: io::Error) -> Option<Result<RawEntry, SourceError>> {
        self.done = true;
        Some(Err(SourceError::Iteration {
            path: self.path.to_path_buf(),
            source,
        }))
    }
}

impl<T: KeyTable> Iterator for KeyWalk<'_, T> {
    type Item = Result<RawEntry, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            // A hash map restarts from its first key when the cursor key is deleted under
            // us, so bound the walk to keep a churning map from looping forever.
            if self.visited >= self.limit {
                warn!(
                    "Stopping pass over {} after {} keys; the map is changing faster than it can be read",
                    self.path.display(),
                    self.visited
                );
                self.done = true;
                break;
            }

            let mut next_key = vec![0u8; self.key_size];
            match self.table.next_key(self.cursor.as_deref(), &mut next_key) {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(e) => return self.fail(e),
            }
            self.visited += 1;

            // After a restart the walk replays keys it already returned.
            if self.seen.contains(&next_key) {
                self.cursor = Some(next_key);
                continue;
            }

            let mut value = vec![0u8; self.value_size];
            let key = key_from_bytes(&next_key);
            match self.table.lookup(&next_key, &mut value) {
                Ok(true) => {
                    self.seen.insert(next_key.clone());
                    self.cursor = Some(next_key);
                    return Some(Ok(RawEntry { key, value }));
                }
                // The cursor stays on the last live key so the walk does not restart.
                Ok(false) => debug!("Key {} deleted during iteration; skipping", key),
                Err(e) => return self.fail(e),
            }
        }
        None
    }
}

pub struct PinnedMapIter<'a> {
    walk: KeyWalk<'a, MapData>,
}

impl Iterator for PinnedMapIter<'_> {
    type Item = Result<RawEntry, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.walk.next()
    }
}

/// Reads the map directly through its bpffs pin.
///
/// The pin is reopened on every pass so a map that is recreated by the loader is picked up
/// without restarting.
pub struct PinnedMapSource {
    path: PathBuf,
    current: Option<PinnedMap>,
}

impl PinnedMapSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
        }
    }
}

impl MapSource for PinnedMapSource {
    fn describe(&self) -> String {
        format!("pinned map {}", self.path.display())
    }

    fn entries(&mut self) -> Result<Entries<'_>, SourceError> {
        self.current = None;
        let map = self.current.insert(PinnedMap::open(&self.path)?);
        Ok(Box::new(map.iter()))
    }
}
