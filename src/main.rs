//! memprobe: exercises a page-locked memory region with a battery of
//! bit-pattern write/verify tests to expose stuck bits, bad address lines,
//! coupling faults and retention errors before the RAM is trusted.

use std::io;
use std::process;
use std::time::{Duration, Instant};

mod edac;
mod logger;
mod region;
mod utils;

use region::Region;
use tests::{Diag, TESTS};

// Exit status is a bitmask of fault classes, not magnitudes.
const EXIT_FAIL_NONSTARTER: i32 = 0x01;
const EXIT_FAIL_ADDRESSLINES: i32 = 0x02;
const EXIT_FAIL_OTHERTEST: i32 = 0x04;

/// Totals accumulated across the whole run.
#[derive(Debug, Default)]
struct RunSummary {
    bytes_tested: u64,
    stuck_address_failures: u64,
    pattern_failures: u64,
    elapsed: Duration,
}

fn exit_status(acquired: bool, stuck_address_failures: u64, pattern_failures: u64) -> i32 {
    if !acquired {
        return EXIT_FAIL_NONSTARTER;
    }
    let mut status = 0;
    if stuck_address_failures > 0 {
        status |= EXIT_FAIL_ADDRESSLINES;
    }
    if pattern_failures > 0 {
        status |= EXIT_FAIL_OTHERTEST;
    }
    status
}

fn main() {
    let config = utils::parse_args();

    if let Err(e) = logger::init_logger(config.log_file.as_deref()) {
        eprintln!("failed to initialize logger: {}", e);
    }

    let mut region = match Region::acquire(config.bytes, &config.mode) {
        Ok(region) => region,
        Err(e) => {
            log_error_fmt!("{}", e);
            process::exit(EXIT_FAIL_NONSTARTER);
        }
    };
    log_info_fmt!(
        "Testing {} MB ({} bytes){}",
        region.len() / (1024 * 1024),
        region.len(),
        match region.phys_base() {
            Some(base) => format!(" at physical base {base:#x}"),
            None => String::new(),
        }
    );
    log_debug_fmt!("Test mask: 0x{:08X}, narrow writes: {}", config.mask, config.narrow);

    let mut edac = edac::EdacMonitor::new();
    edac.check();

    let started = Instant::now();
    let mut summary = RunSummary::default();
    let mut stderr = io::stderr();

    let mut loop_no = 0u64;
    loop {
        loop_no += 1;
        if config.loops > 0 {
            log_info_fmt!("Loop {}/{}:", loop_no, config.loops);
        } else {
            log_info_fmt!("Loop {}:", loop_no);
        }

        let mut diag = Diag::new(&mut stderr);
        let errors = tests::test_stuck_address(&region.window(), &mut diag);
        report_result("Stuck Address", errors);
        summary.stuck_address_failures += errors as u64;
        summary.bytes_tested += region.len() as u64;

        let region_len = region.len() as u64;
        let (a, b) = region.split();
        for test in TESTS {
            if test.mask & config.mask == 0 {
                continue;
            }
            if test.narrow && !config.narrow {
                continue;
            }
            let errors = tests::run_test(test, &a, &b, &mut diag);
            report_result(test.name, errors);
            summary.pattern_failures += errors as u64;
            summary.bytes_tested += region_len;
        }

        edac.check();
        if config.loops > 0 && loop_no >= config.loops {
            break;
        }
    }
    summary.elapsed = started.elapsed();

    log_info_fmt!(
        "Done: {} MB tested in {:.2}s, {} address-line failure(s), {} pattern failure(s)",
        summary.bytes_tested / (1024 * 1024),
        summary.elapsed.as_secs_f64(),
        summary.stuck_address_failures,
        summary.pattern_failures
    );
    edac.check();

    let status = exit_status(
        true,
        summary.stuck_address_failures,
        summary.pattern_failures,
    );
    drop(region);
    process::exit(status);
}

fn report_result(name: &str, errors: usize) {
    if errors == 0 {
        log_info_fmt!("  {:22}: ok", name);
    } else {
        log_error_fmt!("  {:22}: FAILED ({} mismatched words)", name, errors);
    }
}

#[cfg(test)]
mod main_tests {
    use super::*;

    #[test]
    fn test_exit_status_nonstarter_wins() {
        assert_eq!(exit_status(false, 0, 0), EXIT_FAIL_NONSTARTER);
    }

    #[test]
    fn test_exit_status_clean_run() {
        assert_eq!(exit_status(true, 0, 0), 0);
    }

    #[test]
    fn test_exit_status_separates_fault_classes() {
        assert_eq!(exit_status(true, 3, 0), EXIT_FAIL_ADDRESSLINES);
        assert_eq!(exit_status(true, 0, 9), EXIT_FAIL_OTHERTEST);
        assert_eq!(
            exit_status(true, 1, 1),
            EXIT_FAIL_ADDRESSLINES | EXIT_FAIL_OTHERTEST
        );
    }
}
