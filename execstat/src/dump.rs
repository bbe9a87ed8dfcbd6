//! One-shot dump of the counter map.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use execstat_common::PROC_INFO_SIZE;
use log::{info, warn};
use serde::Serialize;

use crate::aggregate::{Report, aggregate};
use crate::decode::{Decoded, ProcessRecord, decode_entry, raw_view};
use crate::error::SourceError;
use crate::source::{PinnedMap, RawEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpMode {
    /// One JSON line per entry.
    #[default]
    Structured,
    /// Hex view of every value, with leading fields decoded where possible.
    Raw,
    /// Per-name report table.
    Aggregate,
}

#[derive(Serialize)]
struct DumpLine<'a> {
    key: u32,
    value: &'a ProcessRecord,
}

/// Open the pin at `path` and write its entries to `out`.
pub fn dump(path: &Path, mode: DumpMode, out: &mut impl Write) -> Result<()> {
    let map = PinnedMap::open(path)?;
    let meta = map.meta();

    info!(
        "Map {} at {}: key size {}, value size {}, max entries {}, record size {}",
        meta.name,
        path.display(),
        meta.key_size,
        meta.value_size,
        meta.max_entries,
        PROC_INFO_SIZE
    );
    if meta.value_size as usize != PROC_INFO_SIZE {
        warn!(
            "Value size {} bytes does not match record size {} bytes; entries may not decode",
            meta.value_size, PROC_INFO_SIZE
        );
    }

    let written = write_entries(map.iter(), mode, out)?;
    info!("Dumped {} entries", written);
    Ok(())
}

/// Write one pass of entries in `mode`. Returns the number of entries read.
///
/// A read error stops the dump; anything already written stays written.
pub fn write_entries<I>(entries: I, mode: DumpMode, out: &mut impl Write) -> Result<usize>
where
    I: IntoIterator<Item = Result<RawEntry, SourceError>>,
{
    let mut count = 0;
    let mut records = Vec::new();

    for entry in entries {
        let entry = entry?;
        count += 1;

        match mode {
            DumpMode::Raw => writeln!(out, "{}", raw_view(&entry))?,
            DumpMode::Structured => match decode_entry(&entry) {
                Decoded::Record { key, record } => {
                    let line = serde_json::to_string(&DumpLine {
                        key,
                        value: &record,
                    })
                    .context("serializing entry")?;
                    writeln!(out, "{}", line)?;
                }
                Decoded::Raw(raw) => {
                    if let Some(mismatch) = raw.mismatch {
                        warn!("Key {}: {}", raw.key, mismatch);
                    }
                    writeln!(out, "{}", raw)?;
                }
            },
            DumpMode::Aggregate => match decode_entry(&entry).into_record() {
                Some(record) => records.push(record),
                None => warn!(
                    "Key {}: {} byte value is too short to decode; skipped",
                    entry.key,
                    entry.value.len()
                ),
            },
        }
    }

    if mode == DumpMode::Aggregate {
        write!(out, "{}", Report::new(aggregate(records)))?;
    }
    out.flush()?;
    Ok(count)
}
