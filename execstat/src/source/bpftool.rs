//! `bpftool map dump` as a map source.
//!
//! `bpftool -j map dump pinned <path>` prints a JSON array. Each element carries the key and
//! value as arrays of hex byte strings, and a `formatted` object when the map has BTF:
//!
//! ```text
//! [{"key":["0x01","0x00","0x00","0x00"],"value":["0x62",...],
//!   "formatted":{"key":1,"value":{"comm":"bash","pid":100,"count":5}}}]
//! ```

use std::path::PathBuf;
use std::process::Command;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::decode::ProcessRecord;
use crate::error::SourceError;
use crate::source::{Entries, MapSource, RawEntry, key_from_bytes};

static SEPARATOR_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:Found \d+ elements?|[-=]{3,})$").expect("separator pattern is valid")
});

pub struct BpftoolSource {
    program: String,
    path: PathBuf,
}

impl BpftoolSource {
    pub fn new(program: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            path: path.into(),
        }
    }

    fn run(&self) -> Result<String, SourceError> {
        // TODO: bound this call with a per-cycle timeout; a wedged bpftool currently stalls
        // the sampling loop until it exits.
        let output = Command::new(&self.program)
            .args(["-j", "map", "dump", "pinned"])
            .arg(&self.path)
            .output()
            .map_err(|e| SourceError::Subprocess {
                program: self.program.clone(),
                reason: format!("could not be started: {e}"),
                stderr: String::new(),
            })?;

        if !output.status.success() {
            return Err(SourceError::Subprocess {
                program: self.program.clone(),
                reason: format!("exited with {}", output.status),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|e| SourceError::parse("output is not UTF-8", hex::encode(e.as_bytes())))
    }
}

impl MapSource for BpftoolSource {
    fn describe(&self) -> String {
        format!("{} dump of {}", self.program, self.path.display())
    }

    fn entries(&mut self) -> Result<Entries<'_>, SourceError> {
        let stdout = self.run()?;
        let entries = parse_dump(&stdout)?;
        debug!("{} returned {} entries", self.program, entries.len());
        Ok(Box::new(entries.into_iter().map(Ok)))
    }
}

#[derive(Deserialize)]
struct DumpElement {
    key: Option<Value>,
    value: Option<Value>,
    formatted: Option<Formatted>,
}

#[derive(Deserialize)]
struct Formatted {
    key: Value,
    value: FormattedValue,
}

#[derive(Deserialize)]
struct FormattedValue {
    comm: String,
    pid: u32,
    count: u64,
}

impl From<FormattedValue> for ProcessRecord {
    fn from(v: FormattedValue) -> Self {
        ProcessRecord::new(v.comm, v.pid, v.count)
    }
}

/// Drop blank lines and the banner/separator lines bpftool mixes into its output.
fn strip_separators(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !SEPARATOR_LINE.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse the JSON output of `bpftool -j map dump` into raw entries.
pub fn parse_dump(text: &str) -> Result<Vec<RawEntry>, SourceError> {
    let cleaned = strip_separators(text);
    if cleaned.is_empty() {
        return Ok(Vec::new());
    }

    let elements: Vec<DumpElement> =
        serde_json::from_str(&cleaned).map_err(|e| SourceError::parse(e, text))?;

    elements
        .into_iter()
        .enumerate()
        .map(|(i, element)| {
            to_raw_entry(element).map_err(|reason| {
                SourceError::parse(format!("element {i}: {reason}"), text)
            })
        })
        .collect()
}

fn to_raw_entry(element: DumpElement) -> Result<RawEntry, String> {
    let DumpElement {
        key,
        value,
        formatted,
    } = element;

    let key = match (key, &formatted) {
        (Some(key), _) => parse_key(&key)?,
        (None, Some(formatted)) => parse_key(&formatted.key)?,
        (None, None) => return Err("missing key".to_string()),
    };

    let value = match (value, formatted) {
        (Some(Value::Array(bytes)), _) => hex_bytes(&bytes)?,
        (Some(object @ Value::Object(_)), _) => serde_json::from_value::<FormattedValue>(object)
            .map(|v| ProcessRecord::from(v).to_bytes().to_vec())
            .map_err(|e| format!("value: {e}"))?,
        (None, Some(formatted)) => ProcessRecord::from(formatted.value).to_bytes().to_vec(),
        (Some(other), _) => return Err(format!("unexpected value {other}")),
        (None, None) => return Err("missing value".to_string()),
    };

    Ok(RawEntry { key, value })
}

fn parse_key(key: &Value) -> Result<u32, String> {
    match key {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| format!("key {n} is not a u32")),
        Value::Array(bytes) => Ok(key_from_bytes(&hex_bytes(bytes)?)),
        other => Err(format!("unexpected key {other}")),
    }
}

fn hex_bytes(items: &[Value]) -> Result<Vec<u8>, String> {
    items
        .iter()
        .map(|item| {
            let s = item
                .as_str()
                .ok_or_else(|| format!("byte {item} is not a string"))?;
            let digits = s.trim_start_matches("0x").trim_start_matches("0X");
            u8::from_str_radix(digits, 16).map_err(|e| format!("byte {s:?}: {e}"))
        })
        .collect()
}
