//! Command-line surface and run configuration.

use std::path::PathBuf;

use clap::Parser;
use sysinfo::{System, SystemExt};

use crate::log_info_fmt;
use crate::region::AcquireMode;

#[derive(Parser, Debug)]
#[command(version, about = "Exercises RAM with bit-pattern write/verify tests", long_about = None)]
pub struct Args {
    #[clap(short = 'm', long = "memory", value_parser = parse_size,
            help = "Memory size to test; default unit is MB (default: free memory minus 1GB)")]
    memory: Option<u64>,

    #[clap(short = 'l', long = "loops", default_value = "1",
            help = "Number of test loops (0 = run until interrupted)")]
    loops: u64,

    #[clap(short = 'd', long = "device", env = "MEMPROBE_DEVICE",
            help = "Physical memory device to map instead of heap allocation (e.g. /dev/mem)")]
    device: Option<PathBuf>,

    #[clap(short = 'b', long = "phys-base", value_parser = parse_hex_or_dec, default_value = "0",
            help = "Physical offset into the device mapping (hex accepted, ignored without --device)")]
    phys_base: u64,

    #[clap(long = "narrow",
            help = "Also run the 8-bit and 16-bit wide write tests")]
    narrow: bool,

    #[clap(short = 'p', long = "mask", value_parser = parse_hex_or_dec, default_value = "0xffffffff",
            help = "Test selection mask (see --help-masks)")]
    mask: u64,

    #[clap(long = "help-masks", help = "List the per-test selection masks and exit")]
    help_masks: bool,

    #[clap(short = 'L', long = "log-path",
            help = "Directory to write memprobe.log into (console only when omitted)")]
    log_path: Option<String>,
}

/// Resolved run configuration handed to the orchestrator.
#[derive(Debug)]
pub struct Config {
    pub bytes: usize,
    pub loops: u64,
    pub mode: AcquireMode,
    pub narrow: bool,
    pub mask: u64,
    pub log_file: Option<String>,
}

pub fn parse_args() -> Config {
    let args = Args::parse();
    if args.help_masks {
        crate::tests::print_test_mask_help();
        std::process::exit(0);
    }

    let bytes = match args.memory {
        Some(size) => size as usize,
        None => default_memory_size(),
    };
    let mode = match args.device {
        Some(path) => AcquireMode::Device {
            path,
            phys_base: args.phys_base,
        },
        None => AcquireMode::Heap,
    };
    let log_file = args
        .log_path
        .map(|dir| format!("{}/memprobe.log", dir.trim_end_matches('/')));

    Config {
        bytes,
        loops: args.loops,
        mode,
        narrow: args.narrow,
        mask: args.mask,
        log_file,
    }
}

/// Free memory minus a 1 GiB reserve for the rest of the system, floored at
/// 1 MiB, when no explicit size is given.
fn default_memory_size() -> usize {
    let mut system = System::new_all();
    system.refresh_memory();

    // sysinfo reports KB.
    let free = system.free_memory() * 1024;
    let reserved = 1024 * 1024 * 1024u64;
    let usable = if free > reserved {
        free - reserved
    } else {
        free * 3 / 4
    };
    let chosen = usable.max(1024 * 1024);

    log_info_fmt!(
        "Free memory: {:.2} GB, defaulting to testing {:.2} GB",
        free as f64 / (1024.0 * 1024.0 * 1024.0),
        chosen as f64 / (1024.0 * 1024.0 * 1024.0)
    );
    chosen as usize
}

fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.to_uppercase();
    let (num_str, mult) = if s.ends_with('B') {
        (&s[..s.len() - 1], 1)
    } else if s.ends_with('K') {
        (&s[..s.len() - 1], 1024)
    } else if s.ends_with('M') {
        (&s[..s.len() - 1], 1024 * 1024)
    } else if s.ends_with('G') {
        (&s[..s.len() - 1], 1024 * 1024 * 1024)
    } else {
        (s.as_str(), 1024 * 1024)
    };

    num_str
        .parse::<u64>()
        .map(|n| n * mult)
        .map_err(|_| format!("invalid memory size: {}", s))
}

fn parse_hex_or_dec(s: &str) -> Result<u64, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| format!("invalid hex value: {}", s))
    } else {
        s.parse::<u64>().map_err(|_| format!("invalid value: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("512B"), Ok(512));
        assert_eq!(parse_size("4k"), Ok(4 * 1024));
        assert_eq!(parse_size("8M"), Ok(8 * 1024 * 1024));
        assert_eq!(parse_size("2G"), Ok(2 * 1024 * 1024 * 1024));
    }

    #[test]
    fn test_parse_size_defaults_to_megabytes() {
        assert_eq!(parse_size("64"), Ok(64 * 1024 * 1024));
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("lots").is_err());
        assert!(parse_size("12Q").is_err());
    }

    #[test]
    fn test_parse_hex_or_dec() {
        assert_eq!(parse_hex_or_dec("0x1000"), Ok(0x1000));
        assert_eq!(parse_hex_or_dec("0XFF"), Ok(255));
        assert_eq!(parse_hex_or_dec("4096"), Ok(4096));
        assert!(parse_hex_or_dec("0xzz").is_err());
    }
}
