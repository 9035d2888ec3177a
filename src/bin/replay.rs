use anyhow::{bail, Result};
use clap::Parser;
use order_feed::capture::read_capture;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(about = "Read a subscriber capture, verify ordering and report losses")]
struct Args {
    /// Input capture file (.bin)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Print every delivered order
    #[arg(long, default_value_t = false)]
    print: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let capture = read_capture(&args.input)?;
    let h = &capture.header;
    eprintln!(
        "Header: v{} client-{} group={} created={}ns",
        h.version, h.client_id, h.group, h.created_unix_ns
    );
    if args.print {
        for r in &capture.records {
            println!("{}", r);
        }
    }
    eprintln!("Read {} records, {} missing.", capture.records.len(), capture.missing_count());
    for r in capture.missing() {
        if r.end - r.start == 1 {
            eprintln!("  lost #{}", r.start);
        } else {
            eprintln!("  lost #{}..#{}", r.start, r.end - 1);
        }
    }
    if let Some(i) = capture.first_order_violation() {
        bail!(
            "ordering violation at record {}: #{} after #{}",
            i,
            capture.records[i].sequence,
            capture.records[i - 1].sequence
        );
    }
    Ok(())
}
