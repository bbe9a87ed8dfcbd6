use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use execstat::dump::{DumpMode, dump};
use execstat::parse_args;

/// Print the contents of a pinned execve counter map once.
#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// bpffs path of the pinned map
    map_path: PathBuf,

    /// Print every value as hex, decoding the leading fields where possible
    #[clap(long, conflicts_with = "aggregate")]
    raw: bool,

    /// Print per-process totals instead of individual entries
    #[clap(long)]
    aggregate: bool,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

impl Opt {
    fn mode(&self) -> DumpMode {
        if self.raw {
            DumpMode::Raw
        } else if self.aggregate {
            DumpMode::Aggregate
        } else {
            DumpMode::Structured
        }
    }
}

fn main() -> Result<()> {
    let opt: Opt = parse_args();

    // Map metadata is logged at info, so keep it visible by default.
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "debug" } else { "info" }),
    )
    .init();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    dump(&opt.map_path, opt.mode(), &mut out)
}
