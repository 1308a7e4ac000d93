use std::thread;

use super::*;

/// Mostly small records, now and then one that spans several buffers.
fn record_len() -> usize {
    let mut rng = rand::rng();
    if rng.random_bool(0.02) {
        rng.random_range(16 * 1024..48 * 1024)
    } else {
        rng.random_range(8..600)
    }
}

fn run_inner(config: Config) {
    let crash_during_initialization = rand::rng().random_bool(0.1);

    if crash_during_initialization {
        spawn_killah();
    }

    let log = config.open().expect("couldn't open log");

    if !crash_during_initialization {
        spawn_killah();
    }

    let mut n = verify(&log);
    let mut trn = Transaction::system();

    // a small record to replay from, so the directory stays bounded
    // across runs
    let marker = write(&log, &mut trn, n, 8);
    log.checkpoint(marker).expect("couldn't checkpoint");
    log.purge(marker).expect("couldn't purge");
    n += 1;

    loop {
        let lsn = write(&log, &mut trn, n, record_len());
        if rand::rng().random_bool(0.05) {
            log.flush(lsn).expect("couldn't flush");
        }
        n += 1;
    }
}

pub fn run_crash_sequential_writes() {
    let config = crash_config(SEQUENTIAL_WRITES_DIR);

    if let Err(e) = thread::spawn(|| run_inner(config)).join() {
        println!("worker thread failed: {:?}", e);
        std::process::exit(15);
    }
}
