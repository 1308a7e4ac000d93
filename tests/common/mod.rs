#![allow(dead_code)]

use translog::{Config, Lsn, RecordKind, Transaction, Translog};

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record.module_path().unwrap().split("::").last().unwrap(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

pub fn cleanup(dir: &str) {
    let dir = std::path::Path::new(dir);
    if dir.exists() {
        std::fs::remove_dir_all(dir).unwrap();
    }
}

/// Small pages and buffers so that tests cross page, buffer and file
/// boundaries quickly.
pub fn small_config(path: &std::path::Path) -> Config {
    Config::new()
        .path(path)
        .page_size(512)
        .buffer_size(512 * 8)
        .buffers(4)
        .file_size(512 * 64)
        .flush_every_ms(None)
}

/// A body that carries `n` at its front and is `len` bytes long.
pub fn numbered_body(n: u64, len: usize) -> Vec<u8> {
    let mut body = n.to_be_bytes().to_vec();
    body.resize(len.max(8), (n % 251) as u8);
    body
}

pub fn body_number(body: &[u8]) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&body[..8]);
    u64::from_be_bytes(buf)
}

pub fn write_numbered(log: &Translog, n: u64, len: usize) -> Lsn {
    let mut trn = Transaction::system();
    log.write_record(RecordKind::RedoInsertRow, &mut trn, &numbered_body(n, len)).unwrap()
}
