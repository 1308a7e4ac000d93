use std::thread;

use super::*;

const WRITERS: u64 = 4;

/// The recovered checkpoint must be readable and the files must still
/// reach back to it.
fn verify_checkpoint(log: &Translog) {
    let checkpoint = log.last_checkpoint();
    if checkpoint.is_impossible() {
        return;
    }

    assert!(
        checkpoint >= log.log_start(),
        "checkpoint {} was purged, log starts at {}",
        checkpoint,
        log.log_start()
    );
    assert!(checkpoint <= log.last_lsn());
    log.read_record(checkpoint).expect("couldn't read the checkpointed record");
}

fn run_inner(config: Config) {
    let log = config.open().expect("couldn't open log");
    spawn_killah();

    verify_checkpoint(&log);

    // records from several writers are only ordered per writer, so every
    // recovered body just has to be intact
    let iter = match log.last_checkpoint() {
        checkpoint if checkpoint.is_impossible() => log.iter(),
        checkpoint => log.iter_from(checkpoint),
    };
    for res in iter.expect("couldn't iterate the recovered log") {
        let record = res.expect("couldn't read a recovered record");
        let n = body_number(&record.body);
        assert!(record.body[8..].iter().all(|b| *b == (n % 251) as u8));
    }

    let log = std::sync::Arc::new(log);
    let mut threads = vec![];
    for writer in 0..WRITERS {
        let log = log.clone();
        threads.push(thread::spawn(move || {
            let mut trn = Transaction::system();
            let mut n = writer;
            loop {
                write(&log, &mut trn, n, rand::rng().random_range(8..2000));
                n += WRITERS;
            }
        }));
    }

    loop {
        thread::sleep(std::time::Duration::from_micros(rand::rng().random_range(100..2000)));
        let last = log.last_lsn();
        if last.is_impossible() {
            continue;
        }
        log.checkpoint(last).expect("couldn't checkpoint");
        log.purge(last).expect("couldn't purge");
        verify_checkpoint(&log);
    }
}

pub fn run_crash_checkpoint_purge() {
    let config = crash_config(CHECKPOINT_PURGE_DIR);

    if let Err(e) = thread::spawn(|| run_inner(config)).join() {
        println!("worker thread failed: {:?}", e);
        std::process::exit(15);
    }
}
