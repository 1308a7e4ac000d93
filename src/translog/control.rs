//! The control file remembers what the log files themselves cannot: the
//! last checkpoint and the lowest file still needed.
//!
//! `[magic: 8][body length: 4][bincode body][crc32 of everything before]`

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use fault_injection::{annotate, fallible};
use serde::{Deserialize, Serialize};

use crate::{Error, Lsn, Result};

pub(crate) const CONTROL_FILE: &str = "aria_log_control";
const TMP_SUFFIX: &str = ".tmp";
const MAGIC: [u8; 8] = [0xFE, 0xFE, 0x0C, 0x01, b'M', b'A', b'C', b'F'];
const FRAME_PREFIX: usize = MAGIC.len() + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub(crate) struct ControlState {
    /// Address of the last checkpoint, `Lsn::IMPOSSIBLE` if none was taken.
    pub checkpoint: Lsn,
    /// Lowest log file that has not been purged.
    pub min_file: u32,
    /// Highest log file known when the control file was written.
    pub last_file: u32,
}

fn control_path(dir: &Path, temporary: bool) -> PathBuf {
    if temporary {
        dir.join(format!("{CONTROL_FILE}{TMP_SUFFIX}"))
    } else {
        dir.join(CONTROL_FILE)
    }
}

fn corrupt(reason: &str) -> Error {
    Error::corruption(Lsn::IMPOSSIBLE, format!("control file: {}", reason))
}

pub(crate) fn serialize(state: &ControlState) -> Result<Vec<u8>> {
    let body = bincode::serialize(state)
        .map_err(|e| Error::ReportableBug(format!("failed to serialize control state: {}", e)))?;

    let mut frame = Vec::with_capacity(FRAME_PREFIX + body.len() + 4);
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

pub(crate) fn deserialize(frame: &[u8]) -> Result<ControlState> {
    if frame.len() < FRAME_PREFIX + 4 || frame[..MAGIC.len()] != MAGIC {
        return Err(corrupt("bad magic"));
    }

    let len_bytes = &frame[MAGIC.len()..FRAME_PREFIX];
    let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    if frame.len() != FRAME_PREFIX + len + 4 {
        return Err(corrupt("length mismatch"));
    }

    let crc_at = FRAME_PREFIX + len;
    let crc_bytes = &frame[crc_at..];
    let crc_recorded = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if crc32fast::hash(&frame[..crc_at]) != crc_recorded {
        log::warn!("encountered incorrect crc in log control file");
        return Err(corrupt("crc mismatch"));
    }

    bincode::deserialize(&frame[FRAME_PREFIX..crc_at]).map_err(|_| corrupt("undecodable body"))
}

/// Reads the control file, `None` if there is none yet.
pub(crate) fn read(dir: &Path) -> Result<Option<ControlState>> {
    let tmp_path = control_path(dir, true);
    if tmp_path.exists() {
        log::warn!("ignoring incomplete control file rewrite {:?}", tmp_path);
    }

    match fs::read(control_path(dir, false)) {
        Ok(frame) => deserialize(&frame).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(annotate!(e).into()),
    }
}

/// Replaces the control file: the new contents go to a temporary file that
/// is synced and renamed over the old one before the directory is synced.
pub(crate) fn write(dir: &Path, directory_lock: &fs::File, state: &ControlState) -> Result<()> {
    let frame = serialize(state)?;

    let tmp_path = control_path(dir, true);
    log::trace!("writing control state {:?} to {:?}", state, tmp_path);

    let mut options = fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);
    let mut file = fallible!(options.open(&tmp_path));
    fallible!(file.write_all(&frame));
    fallible!(file.sync_all());
    drop(file);

    fallible!(fs::rename(&tmp_path, control_path(dir, false)));
    fallible!(directory_lock.sync_all());
    Ok(())
}
