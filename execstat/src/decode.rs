//! Value decoding for the `execve` counter map.
//!
//! A value whose size matches [`PROC_INFO_SIZE`] decodes into a [`ProcessRecord`]. Any other
//! size takes the raw fallback path: the bytes are kept as hex, and the leading fields are
//! still decoded when the value is long enough to hold them.

use std::fmt;

use execstat_common::{PROC_INFO_SIZE, ProcInfo, comm_bytes};
use serde::Serialize;

use crate::source::RawEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    #[serde(rename = "comm")]
    pub name: String,
    pub pid: u32,
    pub count: u64,
}

impl ProcessRecord {
    pub fn new(name: impl Into<String>, pid: u32, count: u64) -> Self {
        Self {
            name: name.into(),
            pid,
            count,
        }
    }

    fn from_info(info: &ProcInfo) -> Self {
        Self {
            name: String::from_utf8_lossy(comm_bytes(&info.comm)).into_owned(),
            pid: info.pid,
            count: info.count,
        }
    }

    /// Re-encode into the kernel value layout.
    pub fn to_bytes(&self) -> [u8; PROC_INFO_SIZE] {
        ProcInfo::new(self.name.as_bytes(), self.pid, self.count).to_bytes()
    }
}

/// Observed value size disagrees with the record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaMismatch {
    pub expected: usize,
    pub actual: usize,
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "value size {} bytes does not match record size {} bytes",
            self.actual, self.expected
        )
    }
}

/// Raw view of one entry: hex bytes plus whatever could be decoded from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub key: u32,
    pub hex: String,
    /// Leading fields, present when the value holds at least `PROC_INFO_SIZE` bytes.
    pub partial: Option<ProcessRecord>,
    /// Bytes past the record layout, hex-encoded.
    pub trailing: Option<String>,
    pub mismatch: Option<SchemaMismatch>,
}

impl fmt::Display for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "key: {}", self.key)?;
        writeln!(f, "value (hex): {}", self.hex)?;
        if let Some(record) = &self.partial {
            writeln!(
                f,
                "decoded: comm=\"{}\", pid={}, count={}",
                record.name, record.pid, record.count
            )?;
        }
        if let Some(trailing) = &self.trailing {
            writeln!(f, "trailing bytes: {}", trailing)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Record { key: u32, record: ProcessRecord },
    Raw(RawRecord),
}

impl Decoded {
    pub fn key(&self) -> u32 {
        match self {
            Decoded::Record { key, .. } => *key,
            Decoded::Raw(raw) => raw.key,
        }
    }

    /// The decoded fields, exact or best-effort.
    pub fn record(&self) -> Option<&ProcessRecord> {
        match self {
            Decoded::Record { record, .. } => Some(record),
            Decoded::Raw(raw) => raw.partial.as_ref(),
        }
    }

    pub fn into_record(self) -> Option<ProcessRecord> {
        match self {
            Decoded::Record { record, .. } => Some(record),
            Decoded::Raw(raw) => raw.partial,
        }
    }

    pub fn mismatch(&self) -> Option<SchemaMismatch> {
        match self {
            Decoded::Record { .. } => None,
            Decoded::Raw(raw) => raw.mismatch,
        }
    }
}

/// Decode one entry against the record layout, falling back to a raw view on size mismatch.
pub fn decode_entry(entry: &RawEntry) -> Decoded {
    if entry.value.len() == PROC_INFO_SIZE {
        if let Some(info) = ProcInfo::from_bytes(&entry.value) {
            return Decoded::Record {
                key: entry.key,
                record: ProcessRecord::from_info(&info),
            };
        }
    }
    Decoded::Raw(raw_view(entry))
}

/// Raw view of an entry regardless of its size.
pub fn raw_view(entry: &RawEntry) -> RawRecord {
    let value = &entry.value;
    let partial = ProcInfo::from_bytes(value).map(|info| ProcessRecord::from_info(&info));
    let trailing = (value.len() > PROC_INFO_SIZE).then(|| hex::encode(&value[PROC_INFO_SIZE..]));
    let mismatch = (value.len() != PROC_INFO_SIZE).then_some(SchemaMismatch {
        expected: PROC_INFO_SIZE,
        actual: value.len(),
    });

    RawRecord {
        key: entry.key,
        hex: hex::encode(value),
        partial,
        trailing,
        mismatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: u32, value: Vec<u8>) -> RawEntry {
        RawEntry { key, value }
    }

    fn encoded(name: &str, pid: u32, count: u64) -> Vec<u8> {
        ProcessRecord::new(name, pid, count).to_bytes().to_vec()
    }

    #[test]
    fn test_exact_size_decodes_record() {
        let decoded = decode_entry(&entry(1, encoded("bash", 100, 5)));
        assert_eq!(
            decoded,
            Decoded::Record {
                key: 1,
                record: ProcessRecord::new("bash", 100, 5),
            }
        );
        assert!(decoded.mismatch().is_none());
    }

    #[test]
    fn test_roundtrip_fields() {
        for (name, pid, count) in [
            ("sh", 1, 0),
            ("systemd-journal", u32::MAX, u64::MAX),
            ("0123456789abcdef", 4242, 1 << 40),
        ] {
            let bytes = encoded(name, pid, count);
            let record = decode_entry(&entry(0, bytes.clone())).into_record().unwrap();
            assert_eq!(record.to_bytes().to_vec(), bytes);
            assert_eq!(record, ProcessRecord::new(name, pid, count));
        }
    }

    #[test]
    fn test_name_stops_at_first_nul() {
        let mut bytes = encoded("cron", 7, 3);
        bytes[6] = b'x';
        let record = decode_entry(&entry(0, bytes)).into_record().unwrap();
        assert_eq!(record.name, "cron");
    }

    #[test]
    fn test_invalid_utf8_name_is_lossy() {
        let mut bytes = encoded("ab", 7, 3);
        bytes[0] = 0xff;
        let record = decode_entry(&entry(0, bytes)).into_record().unwrap();
        assert_eq!(record.name, "\u{fffd}b");
    }

    #[test]
    fn test_longer_value_falls_back_with_partial_decode() {
        let mut bytes = encoded("bash", 100, 5);
        bytes.extend_from_slice(&[0xaa; 12]);

        let decoded = decode_entry(&entry(9, bytes.clone()));
        let Decoded::Raw(raw) = &decoded else {
            panic!("expected raw fallback, got {decoded:?}");
        };
        assert_eq!(raw.key, 9);
        assert_eq!(raw.hex, hex::encode(&bytes));
        assert_eq!(raw.partial, Some(ProcessRecord::new("bash", 100, 5)));
        assert_eq!(raw.trailing.as_deref(), Some("aaaaaaaaaaaaaaaaaaaaaaaa"));
        assert_eq!(
            raw.mismatch,
            Some(SchemaMismatch {
                expected: 28,
                actual: 40
            })
        );
    }

    #[test]
    fn test_short_value_falls_back_without_partial_decode() {
        for len in [0, 1, 16, 27] {
            let decoded = decode_entry(&entry(2, vec![0x41; len]));
            let Decoded::Raw(raw) = decoded else {
                panic!("expected raw fallback for len {len}");
            };
            assert!(raw.partial.is_none());
            assert!(raw.trailing.is_none());
            assert_eq!(raw.hex.len(), len * 2);
            assert_eq!(raw.mismatch.unwrap().actual, len);
        }
    }

    #[test]
    fn test_raw_view_of_exact_value_has_no_mismatch() {
        let raw = raw_view(&entry(3, encoded("ls", 10, 1)));
        assert!(raw.mismatch.is_none());
        assert!(raw.trailing.is_none());
        assert_eq!(raw.partial, Some(ProcessRecord::new("ls", 10, 1)));
    }

    #[test]
    fn test_raw_record_display() {
        let mut bytes = encoded("bash", 100, 5);
        bytes.extend_from_slice(&[0x01, 0x02]);
        let text = raw_view(&entry(1, bytes)).to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "key: 1");
        assert!(lines[1].starts_with("value (hex): 62617368"));
        assert_eq!(lines[2], "decoded: comm=\"bash\", pid=100, count=5");
        assert_eq!(lines[3], "trailing bytes: 0102");
    }

    #[test]
    fn test_record_serializes_as_dump_value() {
        let json = serde_json::to_string(&ProcessRecord::new("bash", 100, 5)).unwrap();
        assert_eq!(json, r#"{"comm":"bash","pid":100,"count":5}"#);
    }
}
