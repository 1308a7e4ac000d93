//! `translog` is an embedded write-ahead transaction log with
//! sector-protected, crc-checked pages, plus the synode cache query used by
//! a Paxos group communication layer.
//!
//! ```
//! use translog::{Config, RecordKind, Transaction};
//!
//! let log = Config::new().temporary(true).open()?;
//!
//! let mut trn = Transaction::new(7, 0);
//! let first = log.write_record(RecordKind::RedoInsertRow, &mut trn, b"a row")?;
//! let commit = log.write_record(RecordKind::Commit, &mut trn, &[])?;
//! log.flush(commit)?;
//!
//! let kinds: Vec<RecordKind> =
//!     log.iter()?.map(|record| record.map(|r| r.kind)).collect::<Result<_, _>>()?;
//! assert_eq!(kinds, vec![RecordKind::RedoInsertRow, RecordKind::Commit]);
//! assert!(first < commit);
//! # Ok::<(), translog::Error>(())
//! ```
#![warn(
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms,
    missing_copy_implementations
)]
#![warn(clippy::cast_lossless, clippy::redundant_closure_for_method_calls)]

mod config;
mod flusher;
mod result;
mod translog;

/// Synode addressing, the Paxos machine cache and the app-data query.
pub mod xcom;

pub use self::{
    config::{Config, PurgeMode, SyncDirPolicy},
    result::{Error, PageError, Result},
    translog::{
        DISK_DRIVE_SECTOR_SIZE, Iter, LSN_STORE_SIZE, Lsn, MAX_FILE_NUMBER, PAGE_CRC,
        PAGE_RECORD_CRC, PAGE_SECTOR_PROTECTION, Record, RecordClass, RecordKind, Transaction,
        Translog, TranslogAddress, decode_diff, diff_size, encode_diff,
    },
};
