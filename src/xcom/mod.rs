//! The Paxos slot cache of a group communication engine and the query
//! that copies decided payloads out of it.
//!
//! ```
//! use std::sync::Arc;
//!
//! use translog::xcom::{
//!     Ballot, CheckedData, PaxMsg, SynodeCache, SynodeNo, get_synode_app_data,
//! };
//!
//! let cache = SynodeCache::new(1024);
//! let synode = SynodeNo::new(1, 42, 0);
//! cache.get_or_create(synode).lock().learn(Arc::new(PaxMsg {
//!     synode,
//!     proposal: Ballot::new(1, 0),
//!     origin: synode,
//!     data: CheckedData::new(b"hello".to_vec()),
//! }));
//!
//! let mut reply = vec![];
//! get_synode_app_data(&cache, &[synode], &mut reply).unwrap();
//! assert_eq!(reply[0].data.as_slice(), b"hello");
//! ```

mod app_data;
mod cache;
mod checked_data;
mod pax_machine;
mod synode;

pub use self::{
    app_data::{
        AppDataError, SynodeAppData, SynodeAppDataStatus, get_synode_app_data,
        get_synode_app_data_with,
    },
    cache::{MachineRef, PaxosCache, SynodeCache},
    checked_data::{CheckedData, copy_checked_data},
    pax_machine::{Ballot, PaxMachine, PaxMsg, PrepareReply},
    synode::{NULL_SYNODE, SynodeNo},
};
