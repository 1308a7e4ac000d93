use std::fmt;

use concurrent_map::Minimum;
use serde::{Deserialize, Serialize};

/// Identifies one Paxos slot: a message number within a group, proposed
/// by a node.
///
/// Ordered by `(group_id, msgno, node)`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct SynodeNo {
    /// The group the slot belongs to.
    pub group_id: u32,
    /// Position of the slot in the group's replicated log.
    pub msgno: u64,
    /// The node that owns the slot.
    pub node: u32,
}

/// The synode before any real one.
pub const NULL_SYNODE: SynodeNo = SynodeNo { group_id: 0, msgno: 0, node: 0 };

impl Minimum for SynodeNo {
    const MIN: SynodeNo = NULL_SYNODE;
}

impl SynodeNo {
    /// Creates a synode.
    pub const fn new(group_id: u32, msgno: u64, node: u32) -> SynodeNo {
        SynodeNo { group_id, msgno, node }
    }

    /// The first slot of the next message number, owned by node 0.
    pub const fn next_msgno(self) -> SynodeNo {
        SynodeNo { group_id: self.group_id, msgno: self.msgno + 1, node: 0 }
    }

    /// Whether this is the null synode.
    pub fn is_null(&self) -> bool {
        *self == NULL_SYNODE
    }
}

impl fmt::Display for SynodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:x} {} {}}}", self.group_id, self.msgno, self.node)
    }
}
