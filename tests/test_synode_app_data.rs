mod common;

use std::{sync::Arc, thread};

use translog::xcom::{
    AppDataError, Ballot, CheckedData, PaxMsg, SynodeAppDataStatus, SynodeCache, SynodeNo,
    get_synode_app_data,
};

const GROUP: u32 = 0xab;

fn synode(msgno: u64) -> SynodeNo {
    SynodeNo::new(GROUP, msgno, 1)
}

fn decide(cache: &SynodeCache, msgno: u64, payload: &[u8]) -> SynodeNo {
    let s = synode(msgno);
    cache.get_or_create(s).lock().learn(Arc::new(PaxMsg {
        synode: s,
        proposal: Ballot::new(3, 1),
        origin: SynodeNo::new(GROUP, msgno, 7),
        data: CheckedData::new(payload.to_vec()),
    }));
    s
}

#[test]
fn decided_payloads_are_copied() {
    common::setup_logger();
    let cache = SynodeCache::new(64);
    let requested: Vec<SynodeNo> =
        (1..=10).map(|n| decide(&cache, n, format!("payload {}", n).as_bytes())).collect();

    let mut reply = vec![];
    let res = get_synode_app_data(&cache, &requested, &mut reply);
    assert_eq!(SynodeAppDataStatus::from(&res), SynodeAppDataStatus::Ok);

    assert_eq!(reply.len(), requested.len());
    for (n, entry) in (1..=10).zip(&reply) {
        assert_eq!(entry.synode, synode(n));
        assert_eq!(entry.origin, SynodeNo::new(GROUP, n, 7));
        assert_eq!(entry.data.as_slice(), format!("payload {}", n).as_bytes());
    }
}

#[test]
fn undecided_synode_fails_the_whole_request() {
    let cache = SynodeCache::new(64);
    let a = decide(&cache, 1, b"a");
    let pending = synode(2);
    cache.get_or_create(pending);
    let c = decide(&cache, 3, b"c");

    let mut reply = vec![];
    let res = get_synode_app_data(&cache, &[a, pending, c], &mut reply);
    assert_eq!(res, Err(AppDataError::NotDecided(pending)));
    assert_eq!(SynodeAppDataStatus::from(&res), SynodeAppDataStatus::NotDecided);
    assert!(reply.is_empty());
}

#[test]
fn missing_synode_fails_the_whole_request() {
    let cache = SynodeCache::new(64);
    let a = decide(&cache, 1, b"a");
    let missing = synode(99);

    let mut reply = vec![];
    let res = get_synode_app_data(&cache, &[a, missing], &mut reply);
    assert_eq!(res, Err(AppDataError::NotCached(missing)));
    assert_eq!(SynodeAppDataStatus::from(&res), SynodeAppDataStatus::NotCached);
    assert!(reply.is_empty());
}

#[test]
fn empty_request_succeeds_with_nothing() {
    let cache = SynodeCache::new(64);
    let mut reply = vec![];
    get_synode_app_data(&cache, &[], &mut reply).unwrap();
    assert!(reply.is_empty());
}

#[test]
fn reply_must_start_empty() {
    let cache = SynodeCache::new(64);
    let a = decide(&cache, 1, b"a");

    let mut reply = vec![];
    get_synode_app_data(&cache, &[a], &mut reply).unwrap();

    let res = get_synode_app_data(&cache, &[a], &mut reply);
    assert_eq!(res, Err(AppDataError::ReplyNotEmpty));
    assert_eq!(SynodeAppDataStatus::from(&res), SynodeAppDataStatus::Error);
    assert_eq!(reply.len(), 1);
}

#[test]
fn copies_do_not_alias_the_cache() {
    let cache = SynodeCache::new(64);
    let a = decide(&cache, 1, b"original");

    let mut reply = vec![];
    get_synode_app_data(&cache, &[a], &mut reply).unwrap();

    // the cached value changes after the reply was built
    {
        let machine = cache.get(&a).unwrap();
        let mut machine = machine.lock();
        machine.learned_data_mut().unwrap().unwrap().as_mut_slice().fill(b'x');
    }
    assert_eq!(reply[0].data.as_slice(), b"original");

    // and the reply can be changed without touching the cache
    reply[0].data.as_mut_slice()[0] = b'O';
    let machine = cache.get(&a).unwrap();
    assert_eq!(machine.lock().learned().unwrap().data.as_slice(), b"xxxxxxxx");
}

#[test]
fn duplicates_are_copied_each_time() {
    let cache = SynodeCache::new(64);
    let a = decide(&cache, 1, b"twice");

    let mut reply = vec![];
    get_synode_app_data(&cache, &[a, a], &mut reply).unwrap();
    assert_eq!(reply.len(), 2);
    assert_eq!(reply[0], reply[1]);
}

#[test]
fn queries_run_alongside_deciding_threads() {
    common::setup_logger();
    const N: u64 = 200;

    let cache = Arc::new(SynodeCache::new(N as usize * 2));

    let decider = {
        let cache = cache.clone();
        thread::Builder::new()
            .name("decider".into())
            .spawn(move || {
                for n in 1..=N {
                    decide(&cache, n, &n.to_be_bytes());
                }
            })
            .unwrap()
    };

    let reader = {
        let cache = cache.clone();
        thread::Builder::new()
            .name("reader".into())
            .spawn(move || {
                let mut answered = 0;
                while answered < N {
                    let mut reply = vec![];
                    match get_synode_app_data(&*cache, &[synode(answered + 1)], &mut reply) {
                        Ok(()) => {
                            assert_eq!(reply[0].data.as_slice(), &(answered + 1).to_be_bytes());
                            answered += 1;
                        }
                        Err(AppDataError::NotCached(_) | AppDataError::NotDecided(_)) => {
                            assert!(reply.is_empty());
                            thread::yield_now();
                        }
                        Err(other) => panic!("unexpected failure: {}", other),
                    }
                }
            })
            .unwrap()
    };

    decider.join().unwrap();
    reader.join().unwrap();
}
