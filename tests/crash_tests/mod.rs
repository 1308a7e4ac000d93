use std::path::Path;
use std::process::exit;
use std::thread;
use std::time::Duration;

use rand::Rng;

use translog::{Config, Lsn, RecordKind, Transaction, Translog};

mod crash_checkpoint_purge;
mod crash_sequential_writes;

pub use crash_checkpoint_purge::run_crash_checkpoint_purge;
pub use crash_sequential_writes::run_crash_sequential_writes;

// test names, also used as dir names
pub const SEQUENTIAL_WRITES_DIR: &str = "sequential_writes";
pub const CHECKPOINT_PURGE_DIR: &str = "checkpoint_purge";

const CRASH_DIR: &str = "crash_test_files";

fn spawn_killah() {
    thread::spawn(|| {
        let runtime = rand::rng().random_range(0..60_000);
        thread::sleep(Duration::from_micros(runtime));
        exit(9);
    });
}

pub fn crash_path(dir: &str) -> String {
    Path::new(CRASH_DIR).join(dir).to_string_lossy().into_owned()
}

/// Small geometry so that a single run crosses pages, buffers and files.
fn crash_config(dir: &str) -> Config {
    Config::new()
        .path(crash_path(dir))
        .page_size(1024)
        .buffer_size(1024 * 16)
        .buffers(4)
        .file_size(1024 * 256)
        .flush_every_ms(Some(1))
}

fn body(n: u64, len: usize) -> Vec<u8> {
    let mut body = n.to_be_bytes().to_vec();
    body.resize(len.max(8), (n % 251) as u8);
    body
}

fn body_number(body: &[u8]) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&body[..8]);
    u64::from_be_bytes(buf)
}

/// Checks that the recovered log holds a gap-free run of numbered records
/// with intact bodies from the last checkpoint on, and returns the number
/// to continue from.
fn verify(log: &Translog) -> u64 {
    let mut expected: Option<u64> = None;
    let mut last = Lsn::IMPOSSIBLE;

    let iter = match log.last_checkpoint() {
        checkpoint if checkpoint.is_impossible() => log.iter(),
        checkpoint => log.iter_from(checkpoint),
    };
    for res in iter.expect("couldn't iterate the recovered log") {
        let record = res.expect("couldn't read a recovered record");
        assert!(record.lsn > last, "records out of order at {}", record.lsn);
        last = record.lsn;

        let n = body_number(&record.body);
        if let Some(expected) = expected {
            assert_eq!(
                n, expected,
                "gap in the recovered log at {}: found record {}, expected {}",
                record.lsn, n, expected
            );
        }
        assert!(
            record.body[8..].iter().all(|b| *b == (n % 251) as u8),
            "body of record {} at {} is damaged",
            n,
            record.lsn
        );
        expected = Some(n + 1);
    }

    assert_eq!(last, log.last_lsn());
    expected.unwrap_or(0)
}

fn write(log: &Translog, trn: &mut Transaction, n: u64, len: usize) -> Lsn {
    log.write_record(RecordKind::RedoInsertRow, trn, &body(n, len))
        .expect("couldn't write a record")
}
