//! EDAC error-counter monitoring.
//!
//! While the pattern tests hammer the region, the kernel's EDAC drivers keep
//! their own per-DIMM counts of corrected and uncorrected errors. Snapshot
//! the counters at startup and report any increase during the run: a burst
//! of corrected errors under load points at the same marginal hardware the
//! pattern tests are trying to flush out.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

use crate::{log_debug_fmt, log_error_fmt, log_warn_fmt};

const EDAC_ROOT: &str = "/sys/devices/system/edac/mc";

lazy_static! {
    // Label formats seen across BIOS vendors, e.g. "CPU0_DIMM_A1",
    // "Socket0_Channel1_DIMM0", "CPU_SrcID#1_MC#0_Chan#0_DIMM#0".
    static ref CPU_DIMM: Regex = Regex::new(r"CPU(\d+)_DIMM_([A-Z])(\d+)").unwrap();
    static ref SOCKET_CHANNEL: Regex = Regex::new(r"Socket(\d+)_Channel(\d+)_DIMM(\d+)").unwrap();
    static ref SRCID_CHAN: Regex = Regex::new(r"CPU_SrcID#(\d+)_MC#(\d+)_Chan#(\d+)_DIMM#(\d+)").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimmLocation {
    pub socket: u32,
    pub channel: u32,
    pub slot: u32,
}

impl fmt::Display for DimmLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Socket{}/Channel{}/DIMM{}", self.socket, self.channel, self.slot)
    }
}

struct Dimm {
    label: String,
    location: Option<DimmLocation>,
    ce_path: PathBuf,
    ue_path: PathBuf,
    ce_count: u64,
    ue_count: u64,
}

impl Dimm {
    fn describe(&self) -> String {
        match self.location {
            Some(location) => location.to_string(),
            None => self.label.clone(),
        }
    }
}

pub struct EdacMonitor {
    dimms: Vec<Dimm>,
}

impl EdacMonitor {
    /// Scans the EDAC sysfs tree and snapshots the current counters. A
    /// machine without EDAC support yields an empty (and silent) monitor.
    pub fn new() -> Self {
        let mut monitor = EdacMonitor { dimms: Vec::new() };
        let root = Path::new(EDAC_ROOT);
        if !root.exists() {
            log_warn_fmt!("EDAC subsystem not available, error-counter monitoring disabled");
            return monitor;
        }
        if let Err(e) = monitor.scan(root) {
            log_warn_fmt!("failed to scan EDAC tree: {}", e);
        }
        log_debug_fmt!("EDAC monitor tracking {} DIMM(s)", monitor.dimms.len());
        monitor
    }

    fn scan(&mut self, root: &Path) -> io::Result<()> {
        for mc in fs::read_dir(root)? {
            let mc = mc?.path();
            if !mc.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with("mc")) {
                continue;
            }
            for dimm in fs::read_dir(&mc)? {
                let dimm = dimm?.path();
                if dimm.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with("dimm")) {
                    self.add_dimm(&dimm);
                }
            }
        }
        Ok(())
    }

    fn add_dimm(&mut self, dimm_path: &Path) {
        let ce_path = dimm_path.join("dimm_ce_count");
        let ue_path = dimm_path.join("dimm_ue_count");
        let label_path = dimm_path.join("dimm_label");
        let (Ok(label), Ok(ce_count), Ok(ue_count)) = (
            fs::read_to_string(&label_path),
            read_counter(&ce_path),
            read_counter(&ue_path),
        ) else {
            return;
        };
        let label = label.trim().to_string();
        let location = parse_label(&label);
        if location.is_none() {
            log_debug_fmt!("unrecognized DIMM label format: '{}'", label);
        }
        self.dimms.push(Dimm {
            label,
            location,
            ce_path,
            ue_path,
            ce_count,
            ue_count,
        });
    }

    /// Re-reads every counter and reports increases since the last check.
    /// Counter movement never affects the exit status; the status bits
    /// describe only this tool's own fault classes.
    pub fn check(&mut self) {
        for dimm in &mut self.dimms {
            if let Ok(ce) = read_counter(&dimm.ce_path) {
                if ce > dimm.ce_count {
                    log_warn_fmt!(
                        "EDAC corrected errors on {}: {} -> {} (+{})",
                        dimm.describe(),
                        dimm.ce_count,
                        ce,
                        ce - dimm.ce_count
                    );
                    dimm.ce_count = ce;
                }
            }
            if let Ok(ue) = read_counter(&dimm.ue_path) {
                if ue > dimm.ue_count {
                    log_error_fmt!(
                        "EDAC uncorrected errors on {}: {} -> {} (+{})",
                        dimm.describe(),
                        dimm.ue_count,
                        ue,
                        ue - dimm.ue_count
                    );
                    dimm.ue_count = ue;
                }
            }
        }
    }
}

fn read_counter(path: &Path) -> io::Result<u64> {
    let content = fs::read_to_string(path)?;
    content
        .trim()
        .parse::<u64>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn parse_label(label: &str) -> Option<DimmLocation> {
    if let Some(caps) = CPU_DIMM.captures(label) {
        return Some(DimmLocation {
            socket: caps[1].parse().ok()?,
            channel: channel_letter(&caps[2])?,
            slot: caps[3].parse().ok()?,
        });
    }
    if let Some(caps) = SOCKET_CHANNEL.captures(label) {
        return Some(DimmLocation {
            socket: caps[1].parse().ok()?,
            channel: caps[2].parse().ok()?,
            slot: caps[3].parse().ok()?,
        });
    }
    if let Some(caps) = SRCID_CHAN.captures(label) {
        return Some(DimmLocation {
            socket: caps[1].parse().ok()?,
            channel: caps[3].parse().ok()?,
            slot: caps[4].parse().ok()?,
        });
    }
    None
}

fn channel_letter(letter: &str) -> Option<u32> {
    let c = letter.chars().next()?;
    c.is_ascii_uppercase().then(|| c as u32 - 'A' as u32)
}
