mod common;

use std::{sync::Arc, thread};

use rand::Rng;
use rand_distr::{Distribution, Gamma};

use translog::{Config, Error, Lsn, LSN_STORE_SIZE, RecordKind, Transaction};

use common::{body_number, numbered_body, small_config, write_numbered};

#[test]
fn write_then_read_back() {
    common::setup_logger();
    let log = Config::new().temporary(true).flush_every_ms(None).open().unwrap();

    let mut trn = Transaction::new(4, 0);
    let a = log.write_record(RecordKind::RedoInsertRow, &mut trn, b"first row").unwrap();
    let b = log.write_record(RecordKind::RedoInsertRow, &mut trn, b"second row").unwrap();
    let c = log.write_record(RecordKind::Commit, &mut trn, &[]).unwrap();

    assert!(a < b && b < c);
    assert!(c < log.horizon());
    assert_eq!(log.last_lsn(), c);
    assert_eq!(trn.rec_lsn, a);
    assert_eq!(trn.commit_lsn, c);

    let record = log.read_record(b).unwrap();
    assert_eq!(record.kind, RecordKind::RedoInsertRow);
    assert_eq!(record.short_trid, 4);
    assert_eq!(record.body, b"second row");
    assert!(log.flushed() > b);

    let kinds: Vec<RecordKind> = log.iter().unwrap().map(|r| r.unwrap().kind).collect();
    assert_eq!(kinds, vec![RecordKind::RedoInsertRow, RecordKind::RedoInsertRow, RecordKind::Commit]);
}

#[test]
fn bodies_are_checked_against_their_kind() {
    let log = Config::new().temporary(true).flush_every_ms(None).open().unwrap();
    let mut trn = Transaction::system();

    let res = log.write_record(RecordKind::Commit, &mut trn, b"commits carry nothing");
    assert!(matches!(res, Err(Error::Unsupported(_))));

    let res = log.write_record(RecordKind::UndoRowInsert, &mut trn, b"short");
    assert!(matches!(res, Err(Error::Unsupported(_))));
}

#[test]
fn long_transaction_id_is_logged_once() {
    let log = Config::new().temporary(true).flush_every_ms(None).open().unwrap();

    let mut trn = Transaction::new(9, 0x0102_0304_0506);
    log.write_record(RecordKind::RedoInsertRow, &mut trn, b"x").unwrap();
    log.write_record(RecordKind::RedoInsertRow, &mut trn, b"y").unwrap();
    assert!(trn.long_id_logged());

    let records: Vec<_> = log.iter().unwrap().map(Result::unwrap).collect();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].kind, RecordKind::LongTransactionId);
    assert_eq!(records[0].body, vec![6, 5, 4, 3, 2, 1]);
    assert_eq!(records[0].short_trid, 9);
    assert_eq!(records[1].body, b"x");
}

#[test]
fn undo_chain_lsns_round_trip() {
    let dir = tempdir::TempDir::new("undo_chain").unwrap();
    let config = small_config(dir.path());

    let mut trn = Transaction::new(2, 0);
    let mut chain = vec![];
    {
        let log = config.open().unwrap();
        let mut prev = Lsn::IMPOSSIBLE;
        for i in 0..50_u64 {
            let mut body = prev.store().to_vec();
            body.extend_from_slice(&numbered_body(i, 20 + (i as usize * 37) % 700));
            let lsn = log.write_record(RecordKind::UndoRowInsert, &mut trn, &body).unwrap();
            assert_eq!(trn.undo_lsn, lsn);
            chain.push((lsn, prev));
            prev = lsn;
        }

        let mut clr = trn.undo_lsn.store().to_vec();
        clr.extend_from_slice(&[0, 1, 5, 0]);
        log.write_record(RecordKind::ClrEnd, &mut trn, &clr).unwrap();
        log.flush_all().unwrap();
    }

    let log = config.open().unwrap();
    for (lsn, prev) in chain {
        let record = log.read_record(lsn).unwrap();
        assert_eq!(record.lsn_ref(0), Some(prev));
        assert_eq!(record.body[..LSN_STORE_SIZE], prev.store());
    }

    let clr = log.read_record(log.last_lsn()).unwrap();
    assert_eq!(clr.kind, RecordKind::ClrEnd);
    assert_eq!(clr.body.len(), LSN_STORE_SIZE + 4);
}

#[test]
fn concurrent_appends_are_ordered_and_readable() {
    common::setup_logger();
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 150;

    let dir = tempdir::TempDir::new("concurrent_appends").unwrap();
    let log = small_config(dir.path()).file_size(512 * 256).open().unwrap();

    let mut threads = vec![];
    for t in 0..THREADS {
        let log = log.clone();
        threads.push(thread::spawn(move || {
            let mut rng = rand::rng();
            let mut written = vec![];
            for i in 0..PER_THREAD {
                let n = t * PER_THREAD + i;
                let len = rng.random_range(8..1200);
                written.push((write_numbered(&log, n, len), n, len));
            }
            written
        }));
    }

    let mut all = vec![];
    for thread in threads {
        let written = thread.join().unwrap();
        assert!(written.windows(2).all(|w| w[0].0 < w[1].0));
        all.extend(written);
    }

    all.sort_unstable();
    all.dedup_by_key(|(lsn, ..)| *lsn);
    assert_eq!(all.len() as u64, THREADS * PER_THREAD);

    for (lsn, n, len) in &all {
        let record = log.read_record(*lsn).unwrap();
        assert_eq!(record.body, numbered_body(*n, *len));
    }

    let iterated: Vec<Lsn> = log.iter().unwrap().map(|r| r.unwrap().lsn).collect();
    let expected: Vec<Lsn> = all.iter().map(|(lsn, ..)| *lsn).collect();
    assert_eq!(iterated, expected);
}

#[test]
fn fixed_and_large_record_survive_reopen() {
    common::setup_logger();
    let dir = tempdir::TempDir::new("fixed_and_large").unwrap();
    let config = Config::new()
        .path(dir.path())
        .page_size(512)
        .buffer_size(512 * 16)
        .buffers(8)
        .flush_every_ms(None);

    let debug_info: Vec<u8> = (0..40).collect();
    let large: Vec<u8> = (0..2000_u32).map(|i| (i * 7) as u8).collect();

    let (r1, r2, horizon) = {
        let log = config.open().unwrap();
        let mut trn = Transaction::system();
        let r1 = log.write_record(RecordKind::DebugInfo, &mut trn, &debug_info).unwrap();
        let r2 = log.write_record(RecordKind::RedoInsertRow, &mut trn, &large).unwrap();
        log.flush(r2).unwrap();
        assert!(log.flushed() > r2);
        (r1, r2, log.horizon())
    };

    let log = config.open().unwrap();
    assert_eq!(log.horizon(), horizon);
    assert_eq!(log.last_lsn(), r2);

    let first = log.read_record(r1).unwrap();
    assert_eq!(first.kind, RecordKind::DebugInfo);
    assert_eq!(first.body, debug_info);

    let second = log.read_record(r2).unwrap();
    assert_eq!(second.body, large);
}

#[test]
fn writes_continue_after_reopen() {
    let dir = tempdir::TempDir::new("continue_after_reopen").unwrap();
    let config = small_config(dir.path());

    let mut expected = 0;
    for round in 0..4 {
        let log = config.open().unwrap();
        let numbers: Vec<u64> =
            log.iter().unwrap().map(|r| body_number(&r.unwrap().body)).collect();
        assert_eq!(numbers, (0..expected).collect::<Vec<_>>());

        for _ in 0..(10 + round * 7) {
            write_numbered(&log, expected, 30 + (expected as usize * 53) % 900);
            expected += 1;
        }
        log.flush_all().unwrap();
    }
}

#[test]
fn records_larger_than_a_buffer() {
    common::setup_logger();
    let dir = tempdir::TempDir::new("multi_group").unwrap();
    let config = small_config(dir.path()).file_size(512 * 1024);

    let huge = numbered_body(1, 20_000);
    let huger = numbered_body(3, 45_000);
    let lsns = {
        let log = config.open().unwrap();
        let lsns = vec![
            write_numbered(&log, 0, 100),
            log.write_record(RecordKind::FileId, &mut Transaction::system(), &huge).unwrap(),
            write_numbered(&log, 2, 700),
            log.write_record(RecordKind::FileId, &mut Transaction::system(), &huger).unwrap(),
            write_numbered(&log, 4, 10),
        ];
        assert_eq!(log.read_record(lsns[1]).unwrap().body, huge);
        lsns
    };

    let log = config.open().unwrap();
    let records: Vec<_> = log.iter().unwrap().map(Result::unwrap).collect();
    assert_eq!(records.iter().map(|r| r.lsn).collect::<Vec<_>>(), lsns);
    assert_eq!(records[1].body, huge);
    assert_eq!(records[3].body, huger);
    assert_eq!(body_number(&records[4].body), 4);
}

#[test]
fn log_spans_files() {
    let dir = tempdir::TempDir::new("spans_files").unwrap();
    let config = small_config(dir.path()).file_size(512 * 16);

    let gamma = Gamma::new(2.0, 150.0).unwrap();
    let mut rng = rand::rng();
    let lens: Vec<usize> = (0..300).map(|_| 8 + gamma.sample(&mut rng) as usize % 2500).collect();

    let lsns: Vec<Lsn> = {
        let log = config.open().unwrap();
        let lsns = lens.iter().enumerate().map(|(i, len)| write_numbered(&log, i as u64, *len)).collect();
        log.flush_all().unwrap();
        assert!(log.files().count() > 3);
        lsns
    };

    assert!(lsns.windows(2).all(|w| w[0] < w[1]));
    assert!(lsns.last().unwrap().file() > 3);

    let log = config.open().unwrap();
    let read: Vec<(Lsn, Vec<u8>)> = log.iter().unwrap().map(|r| r.map(|r| (r.lsn, r.body)).unwrap()).collect();
    assert_eq!(read.len(), lens.len());
    for (i, (lsn, body)) in read.iter().enumerate() {
        assert_eq!(*lsn, lsns[i]);
        assert_eq!(*body, numbered_body(i as u64, lens[i]));
    }

    let middle = lsns[150];
    let from_middle: Vec<u64> =
        log.iter_from(middle).unwrap().map(|r| body_number(&r.unwrap().body)).collect();
    assert_eq!(from_middle, (150..300).collect::<Vec<_>>());
}

#[test]
fn read_only_logs_refuse_writes() {
    let dir = tempdir::TempDir::new("read_only").unwrap();

    let missing = small_config(dir.path()).read_only(true).open();
    assert!(matches!(missing, Err(Error::Unsupported(_))));

    let lsn = {
        let log = small_config(dir.path()).open().unwrap();
        let lsn = write_numbered(&log, 0, 64);
        log.flush_all().unwrap();
        lsn
    };

    let log = small_config(dir.path()).read_only(true).open().unwrap();
    assert!(log.is_read_only());
    assert_eq!(log.read_record(lsn).unwrap().body, numbered_body(0, 64));

    let mut trn = Transaction::system();
    assert_eq!(log.write_record(RecordKind::RedoInsertRow, &mut trn, b"no"), Err(Error::ReadOnly));
    assert_eq!(log.checkpoint(lsn), Err(Error::ReadOnly));
}

#[test]
fn reads_outside_the_log_are_rejected() {
    let log = Config::new().temporary(true).flush_every_ms(None).open().unwrap();
    let lsn = write_numbered(&log, 0, 10);

    assert!(matches!(log.read_record(log.horizon()), Err(Error::Unsupported(_))));
    assert!(matches!(log.read_record(Lsn::IMPOSSIBLE), Err(Error::Unsupported(_))));
    assert!(log.read_record(lsn).is_ok());
}

#[test]
fn flushed_never_decreases() {
    let dir = tempdir::TempDir::new("flushed_monotonic").unwrap();
    let log = Arc::new(small_config(dir.path()).open().unwrap());

    let writer = {
        let log = log.clone();
        thread::spawn(move || {
            for n in 0..400 {
                write_numbered(&log, n, 16 + (n as usize % 300));
            }
        })
    };

    let mut last = log.flushed();
    for _ in 0..200 {
        log.flush_all().unwrap();
        let now = log.flushed();
        assert!(now >= last);
        last = now;
    }
    writer.join().unwrap();

    log.flush(log.last_lsn()).unwrap();
    assert!(log.flushed() > log.last_lsn());
}

#[test]
fn periodic_flusher_makes_writes_durable() {
    let dir = tempdir::TempDir::new("periodic_flusher").unwrap();
    let log = small_config(dir.path()).flush_every_ms(Some(5)).open().unwrap();

    let lsn = write_numbered(&log, 0, 100);
    let mut waited = 0;
    while log.flushed() <= lsn {
        assert!(waited < 1000, "the flusher never flushed");
        thread::sleep(std::time::Duration::from_millis(5));
        waited += 1;
    }
}
