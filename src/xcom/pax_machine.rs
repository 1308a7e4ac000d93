use std::{collections::TryReserveError, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::xcom::{CheckedData, SynodeNo};

/// A proposal number. Higher counts win, ties are broken by node.
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
pub struct Ballot {
    /// Proposal round.
    pub cnt: i32,
    /// The proposing node.
    pub node: u32,
}

impl Ballot {
    /// Creates a ballot.
    pub const fn new(cnt: i32, node: u32) -> Ballot {
        Ballot { cnt, node }
    }
}

/// A value proposed, accepted or learned for a synode.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxMsg {
    /// The slot the value is for.
    pub synode: SynodeNo,
    /// The ballot the value was proposed under.
    pub proposal: Ballot,
    /// Unique id of the application message carried.
    pub origin: SynodeNo,
    /// The application payload.
    pub data: CheckedData,
}

/// What an acceptor answers to a prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareReply {
    /// The ballot was promised. Carries the value accepted so far, if any.
    Promise {
        /// The promised ballot.
        ballot: Ballot,
        /// Value accepted under an earlier ballot.
        accepted: Option<Arc<PaxMsg>>,
    },
    /// A higher ballot was promised already.
    Reject {
        /// The ballot promised instead.
        promised: Ballot,
    },
    /// The slot is decided.
    Learned(Arc<PaxMsg>),
}

#[derive(Debug, Default)]
struct Proposer {
    ballot: Ballot,
}

#[derive(Debug, Default)]
struct Acceptor {
    promise: Ballot,
    accepted: Option<Arc<PaxMsg>>,
}

#[derive(Debug, Default)]
struct Learner {
    msg: Option<Arc<PaxMsg>>,
}

/// The state of the Paxos instance deciding one synode.
#[derive(Debug)]
pub struct PaxMachine {
    synode: SynodeNo,
    proposer: Proposer,
    acceptor: Acceptor,
    learner: Learner,
}

impl PaxMachine {
    /// A fresh instance for `synode`.
    pub fn new(synode: SynodeNo) -> PaxMachine {
        PaxMachine {
            synode,
            proposer: Proposer::default(),
            acceptor: Acceptor::default(),
            learner: Learner::default(),
        }
    }

    /// The slot this instance decides.
    pub fn synode(&self) -> SynodeNo {
        self.synode
    }

    /// Whether a value has been learned. Once true it stays true.
    pub fn is_finished(&self) -> bool {
        self.learner.msg.is_some()
    }

    /// The learned value, if decided.
    pub fn learned(&self) -> Option<&Arc<PaxMsg>> {
        self.learner.msg.as_ref()
    }

    /// The highest ballot promised.
    pub fn promised(&self) -> Ballot {
        self.acceptor.promise
    }

    /// Picks the next ballot this node proposes with, above anything seen.
    pub fn next_ballot(&mut self, node: u32) -> Ballot {
        let seen = self.proposer.ballot.max(self.acceptor.promise);
        self.proposer.ballot = Ballot::new(seen.cnt + 1, node);
        self.proposer.ballot
    }

    /// Acceptor side of phase 1.
    pub fn handle_prepare(&mut self, ballot: Ballot) -> PrepareReply {
        if let Some(msg) = &self.learner.msg {
            return PrepareReply::Learned(msg.clone());
        }
        if ballot <= self.acceptor.promise && self.acceptor.promise != Ballot::default() {
            return PrepareReply::Reject { promised: self.acceptor.promise };
        }

        self.acceptor.promise = ballot;
        PrepareReply::Promise { ballot, accepted: self.acceptor.accepted.clone() }
    }

    /// Acceptor side of phase 2. Returns whether the value was accepted.
    pub fn handle_accept(&mut self, msg: PaxMsg) -> bool {
        if self.is_finished() || msg.synode != self.synode || msg.proposal < self.acceptor.promise {
            log::trace!(
                "{} rejecting accept under {:?}, promised {:?}",
                self.synode,
                msg.proposal,
                self.acceptor.promise
            );
            return false;
        }

        self.acceptor.promise = msg.proposal;
        self.acceptor.accepted = Some(Arc::new(msg));
        true
    }

    /// Records the decided value. Later calls are ignored.
    pub fn learn(&mut self, msg: Arc<PaxMsg>) {
        if self.is_finished() {
            return;
        }
        if msg.synode != self.synode {
            log::warn!("{} ignoring a value learned for {}", self.synode, msg.synode);
            return;
        }
        log::trace!("{} decided under {:?}", self.synode, msg.proposal);
        self.acceptor.accepted = Some(msg.clone());
        self.learner.msg = Some(msg);
    }

    /// Mutable access to the learned payload, `None` while undecided.
    /// Copies the value first if a reader still holds it, which fails
    /// when the copy cannot be allocated.
    pub fn learned_data_mut(&mut self) -> Result<Option<&mut CheckedData>, TryReserveError> {
        let Some(msg) = self.learner.msg.as_mut() else {
            return Ok(None);
        };
        if Arc::get_mut(msg).is_none() {
            let fresh = PaxMsg {
                synode: msg.synode,
                proposal: msg.proposal,
                origin: msg.origin,
                data: msg.data.try_clone_deep()?,
            };
            *msg = Arc::new(fresh);
        }
        Ok(Arc::get_mut(msg).map(|msg| &mut msg.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(synode: SynodeNo, proposal: Ballot, data: &[u8]) -> PaxMsg {
        PaxMsg { synode, proposal, origin: synode, data: CheckedData::new(data.to_vec()) }
    }

    #[test]
    fn promises_only_higher_ballots() {
        let s = SynodeNo::new(1, 1, 0);
        let mut pm = PaxMachine::new(s);

        assert!(matches!(pm.handle_prepare(Ballot::new(2, 0)), PrepareReply::Promise { .. }));
        assert_eq!(
            pm.handle_prepare(Ballot::new(1, 5)),
            PrepareReply::Reject { promised: Ballot::new(2, 0) }
        );
        assert!(!pm.handle_accept(msg(s, Ballot::new(1, 5), b"late")));
        assert!(pm.handle_accept(msg(s, Ballot::new(2, 0), b"value")));

        match pm.handle_prepare(Ballot::new(3, 1)) {
            PrepareReply::Promise { accepted: Some(accepted), .. } => {
                assert_eq!(accepted.data.as_slice(), b"value")
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(pm.next_ballot(4), Ballot::new(4, 4));
    }

    #[test]
    fn learning_is_one_way() {
        let s = SynodeNo::new(1, 2, 0);
        let mut pm = PaxMachine::new(s);
        assert!(!pm.is_finished());

        pm.learn(Arc::new(msg(s, Ballot::new(1, 0), b"first")));
        pm.learn(Arc::new(msg(s, Ballot::new(9, 0), b"second")));

        assert!(pm.is_finished());
        assert_eq!(pm.learned().unwrap().data.as_slice(), b"first");
        assert!(!pm.handle_accept(msg(s, Ballot::new(10, 0), b"third")));
        assert!(matches!(pm.handle_prepare(Ballot::new(11, 0)), PrepareReply::Learned(_)));
    }

    #[test]
    fn mutating_learned_data_leaves_readers_alone() {
        let s = SynodeNo::new(1, 3, 0);
        let mut pm = PaxMachine::new(s);
        pm.learn(Arc::new(msg(s, Ballot::new(1, 0), b"abc")));

        let reader = pm.learned().unwrap().clone();
        pm.learned_data_mut().unwrap().unwrap().as_mut_slice()[0] = b'x';

        assert_eq!(reader.data.as_slice(), b"abc");
        assert_eq!(pm.learned().unwrap().data.as_slice(), b"xbc");
    }

    #[test]
    fn undecided_machine_has_no_data_to_mutate() {
        let s = SynodeNo::new(1, 4, 0);
        let mut pm = PaxMachine::new(s);
        assert!(matches!(pm.learned_data_mut(), Ok(None)));

        assert!(pm.handle_accept(msg(s, Ballot::new(1, 0), b"accepted")));
        assert!(matches!(pm.learned_data_mut(), Ok(None)));

        pm.learn(Arc::new(msg(s, Ballot::new(1, 0), b"decided")));
        assert_eq!(pm.learned_data_mut().unwrap().unwrap().as_slice(), b"decided");
    }
}
