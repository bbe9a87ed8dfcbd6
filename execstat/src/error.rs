use std::path::PathBuf;

/// Longest payload excerpt carried in error messages.
const PAYLOAD_EXCERPT_LEN: usize = 512;

/// Failures while reading one pass of the counter map.
///
/// Every variant is scoped to a single cycle: the monitor logs it and waits for the next
/// tick, the one-shot dump exits with status 1.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("map {} is unavailable: {source}", path.display())]
    MapUnavailable {
        path: PathBuf,
        #[source]
        source: aya::maps::MapError,
    },

    #[error("reading map {} failed mid-pass: {source}", path.display())]
    Iteration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed: {reason}; stderr: {stderr}")]
    Subprocess {
        program: String,
        reason: String,
        stderr: String,
    },

    #[error("unparseable map dump ({reason}); payload: {}", excerpt(payload))]
    Parse { reason: String, payload: String },
}

impl SourceError {
    pub fn parse(reason: impl ToString, payload: impl Into<String>) -> Self {
        SourceError::Parse {
            reason: reason.to_string(),
            payload: payload.into(),
        }
    }
}

fn excerpt(payload: &str) -> &str {
    if payload.len() <= PAYLOAD_EXCERPT_LEN {
        return payload;
    }
    let mut end = PAYLOAD_EXCERPT_LEN;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    &payload[..end]
}
