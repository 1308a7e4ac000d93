//! Copying decided payloads out of the Paxos cache.

use std::{collections::TryReserveError, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::xcom::{CheckedData, PaxMsg, PaxosCache, SynodeNo};

/// Result codes of the app-data query as they travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SynodeAppDataStatus {
    /// Every payload was copied.
    Ok = 0,
    /// A synode is not in the cache.
    NotCached = 1,
    /// A synode is cached but not decided yet.
    NotDecided = 2,
    /// Copying a payload failed to allocate.
    NoMemory = 3,
    /// The request was malformed.
    Error = 4,
}

/// Why the app-data query failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppDataError {
    /// The reply passed in already held entries.
    ReplyNotEmpty,
    /// The synode is not cached.
    NotCached(SynodeNo),
    /// The synode has not been decided.
    NotDecided(SynodeNo),
    /// Allocating the copy of a payload failed. Entries copied before the
    /// failure stay in the reply.
    NoMemory(TryReserveError),
}

impl AppDataError {
    /// The wire code for this failure.
    pub fn status(&self) -> SynodeAppDataStatus {
        match self {
            AppDataError::ReplyNotEmpty => SynodeAppDataStatus::Error,
            AppDataError::NotCached(_) => SynodeAppDataStatus::NotCached,
            AppDataError::NotDecided(_) => SynodeAppDataStatus::NotDecided,
            AppDataError::NoMemory(_) => SynodeAppDataStatus::NoMemory,
        }
    }
}

impl fmt::Display for AppDataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppDataError::ReplyNotEmpty => write!(f, "reply must be empty"),
            AppDataError::NotCached(s) => write!(f, "synode {} is not cached", s),
            AppDataError::NotDecided(s) => write!(f, "synode {} is not decided", s),
            AppDataError::NoMemory(e) => write!(f, "could not copy app data: {}", e),
        }
    }
}

impl std::error::Error for AppDataError {}

impl From<&Result<(), AppDataError>> for SynodeAppDataStatus {
    fn from(result: &Result<(), AppDataError>) -> SynodeAppDataStatus {
        match result {
            Ok(()) => SynodeAppDataStatus::Ok,
            Err(e) => e.status(),
        }
    }
}

/// The decided payload of one synode.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynodeAppData {
    /// The synode it was decided for.
    pub synode: SynodeNo,
    /// Unique id of the application message.
    pub origin: SynodeNo,
    /// A private copy of the payload.
    pub data: CheckedData,
}

/// Fills `reply` with copies of the decided payloads of `synodes`, in
/// request order.
///
/// Nothing is added unless every synode is cached and decided. The cache
/// is never waited on: an undecided synode fails the query right away.
pub fn get_synode_app_data<C: PaxosCache + ?Sized>(
    cache: &C,
    synodes: &[SynodeNo],
    reply: &mut Vec<SynodeAppData>,
) -> Result<(), AppDataError> {
    get_synode_app_data_with(cache, synodes, reply, CheckedData::try_clone_deep)
}

/// `get_synode_app_data` with the payload copy supplied by the caller.
pub fn get_synode_app_data_with<C, F>(
    cache: &C,
    synodes: &[SynodeNo],
    reply: &mut Vec<SynodeAppData>,
    mut copy: F,
) -> Result<(), AppDataError>
where
    C: PaxosCache + ?Sized,
    F: FnMut(&CheckedData) -> Result<CheckedData, TryReserveError>,
{
    if !reply.is_empty() {
        return Err(AppDataError::ReplyNotEmpty);
    }

    let decided = snapshot(cache, synodes)?;

    reply.try_reserve_exact(decided.len()).map_err(AppDataError::NoMemory)?;

    for msg in decided {
        let data = copy(&msg.data).map_err(|e| {
            log::warn!("out of memory copying the payload of {}", msg.synode);
            AppDataError::NoMemory(e)
        })?;
        reply.push(SynodeAppData { synode: msg.synode, origin: msg.origin, data });
    }

    Ok(())
}

/// The learned messages of `synodes`. Each machine is locked only long
/// enough to check it is decided and take a reference to its value.
fn snapshot<C: PaxosCache + ?Sized>(
    cache: &C,
    synodes: &[SynodeNo],
) -> Result<Vec<Arc<PaxMsg>>, AppDataError> {
    let mut decided = Vec::with_capacity(synodes.len());
    for synode in synodes {
        let Some(machine) = cache.hash_get(synode) else {
            log::debug!("app data requested for uncached synode {}", synode);
            return Err(AppDataError::NotCached(*synode));
        };

        let learned = machine.lock().learned().cloned();
        match learned {
            Some(msg) => decided.push(msg),
            None => {
                log::debug!("app data requested for undecided synode {}", synode);
                return Err(AppDataError::NotDecided(*synode));
            }
        }
    }
    Ok(decided)
}
