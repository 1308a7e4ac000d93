use crate::{
    Error, Result,
    translog::{
        Lsn,
        chunk::{FIXED_HEADER_LEN, head_header_len},
        lsn::{LSN_ESCAPE_SIZE, LSN_STORE_SIZE, decode_diff, encode_diff, encoded_diff_size},
    },
};

const RECORD_CRC_SIZE: usize = 4;
const LONG_TRANSACTION_ID_LEN: usize = 6;
const DEBUG_INFO_LEN: usize = 40;
/// previous undo LSN, file id, undone record type, flags
const CLR_END_LEN: usize = LSN_STORE_SIZE + 2 + 1 + 1;

/// How the length of a record kind is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    /// Always exactly `len` bytes.
    Fixed { len: usize },
    /// `len` bytes, the first `lsns` stored LSNs of which are written
    /// compressed, so the stored length varies.
    PseudoFixed { len: usize, lsns: usize },
    /// Any length, starting with `lsns` stored LSNs.
    Variable { lsns: usize },
}

/// The closed set of records this log knows how to write and read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Binds a transaction's short id to its 6-byte long id.
    LongTransactionId,
    Checkpoint,
    RedoInsertRow,
    RedoDeleteRow,
    /// Starts with the previous undo LSN of the transaction.
    UndoRowInsert,
    /// Starts with the previous undo LSN of the transaction.
    UndoRowDelete,
    /// Compensation record, starts with the undo LSN to continue from.
    ClrEnd,
    Commit,
    CommitWithUndoPurge,
    Prepare,
    FileId,
    /// Free-form diagnostic marker of a fixed size.
    DebugInfo,
}

impl RecordKind {
    pub const ALL: [RecordKind; 12] = [
        RecordKind::LongTransactionId,
        RecordKind::Checkpoint,
        RecordKind::RedoInsertRow,
        RecordKind::RedoDeleteRow,
        RecordKind::UndoRowInsert,
        RecordKind::UndoRowDelete,
        RecordKind::ClrEnd,
        RecordKind::Commit,
        RecordKind::CommitWithUndoPurge,
        RecordKind::Prepare,
        RecordKind::FileId,
        RecordKind::DebugInfo,
    ];

    /// The record type stored in the low six bits of a chunk's first byte.
    pub const fn code(self) -> u8 {
        use RecordKind::*;
        match self {
            LongTransactionId => 1,
            Checkpoint => 2,
            RedoInsertRow => 3,
            RedoDeleteRow => 4,
            UndoRowInsert => 5,
            UndoRowDelete => 6,
            ClrEnd => 7,
            Commit => 8,
            CommitWithUndoPurge => 9,
            Prepare => 10,
            FileId => 11,
            DebugInfo => 12,
        }
    }

    pub fn from_code(code: u8) -> Option<RecordKind> {
        RecordKind::ALL.iter().copied().find(|kind| kind.code() == code)
    }

    pub const fn class(self) -> RecordClass {
        use RecordKind::*;
        match self {
            LongTransactionId => RecordClass::Fixed { len: LONG_TRANSACTION_ID_LEN },
            Commit => RecordClass::Fixed { len: 0 },
            DebugInfo => RecordClass::Fixed { len: DEBUG_INFO_LEN },
            CommitWithUndoPurge => RecordClass::Fixed { len: 1 },
            ClrEnd => RecordClass::PseudoFixed { len: CLR_END_LEN, lsns: 1 },
            UndoRowInsert | UndoRowDelete => RecordClass::Variable { lsns: 1 },
            Checkpoint | RedoInsertRow | RedoDeleteRow | Prepare | FileId => {
                RecordClass::Variable { lsns: 0 }
            }
        }
    }

    /// Number of stored LSNs at the front of the body that are written
    /// delta-compressed against the record's own LSN.
    pub const fn compressed_lsns(self) -> usize {
        match self.class() {
            RecordClass::Fixed { .. } => 0,
            RecordClass::PseudoFixed { lsns, .. } | RecordClass::Variable { lsns } => lsns,
        }
    }

    /// Whether records of this kind go into a fixed chunk.
    pub const fn is_fixed(self) -> bool {
        !matches!(self.class(), RecordClass::Variable { .. })
    }

    /// Length of the chunk header in front of a record of this kind that
    /// fits in one chunk.
    pub fn header_length(self, stored_len: usize) -> usize {
        if self.is_fixed() { FIXED_HEADER_LEN } else { head_header_len(stored_len) }
    }

    pub(crate) fn check_body(self, body: &[u8]) -> Result<()> {
        let ok = match self.class() {
            RecordClass::Fixed { len } | RecordClass::PseudoFixed { len, .. } => {
                body.len() == len
            }
            RecordClass::Variable { lsns } => {
                body.len() >= lsns * LSN_STORE_SIZE && body.len() <= u32::MAX as usize
            }
        };

        if ok {
            Ok(())
        } else {
            Err(Error::Unsupported(format!(
                "a {:?} record cannot have a {} byte body",
                self,
                body.len()
            )))
        }
    }

    /// Appends the leading LSNs of `body` compressed against `lsn`.
    pub(crate) fn encode_lsns(self, lsn: Lsn, body: &[u8], out: &mut Vec<u8>) {
        for i in 0..self.compressed_lsns() {
            let stored = Lsn::load(&body[i * LSN_STORE_SIZE..]);
            encode_diff(lsn, stored, out);
        }
    }

    /// Upper bound of what `encode_lsns` appends.
    pub(crate) fn max_encoded_lsns_len(self) -> usize {
        self.compressed_lsns() * LSN_ESCAPE_SIZE
    }

    /// Appends the body after its leading LSNs, followed by the record CRC
    /// for variable-length records when `record_crc` is set.
    pub(crate) fn encode_tail(self, body: &[u8], record_crc: bool, out: &mut Vec<u8>) {
        out.extend_from_slice(&body[self.compressed_lsns() * LSN_STORE_SIZE..]);
        if record_crc && !self.is_fixed() {
            out.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
        }
    }

    /// The stored form of a record written at `lsn`.
    pub fn encode(self, lsn: Lsn, body: &[u8], record_crc: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + self.max_encoded_lsns_len());
        self.encode_lsns(lsn, body, &mut out);
        self.encode_tail(body, record_crc, &mut out);
        out
    }

    /// Reverses `encode`.
    pub fn decode(self, lsn: Lsn, stored: &[u8], record_crc: bool) -> Result<Vec<u8>> {
        let lsns = self.compressed_lsns();
        let mut body = Vec::with_capacity(stored.len() + lsns * LSN_STORE_SIZE);

        let mut at = 0;
        for _ in 0..lsns {
            let (target, used) = decode_diff(lsn, &stored[at..])
                .ok_or_else(|| Error::corruption(lsn, "bad compressed LSN"))?;
            body.extend_from_slice(&target.store());
            at += used;
        }

        let crc_len = if record_crc && !self.is_fixed() { RECORD_CRC_SIZE } else { 0 };
        if stored.len() < at + crc_len {
            return Err(Error::corruption(lsn, "record shorter than its header"));
        }
        let (rest, crc) = stored[at..].split_at(stored.len() - at - crc_len);
        body.extend_from_slice(rest);

        if crc_len != 0 {
            let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
            if crc32fast::hash(&body) != expected {
                return Err(Error::corruption(lsn, "record crc mismatch"));
            }
        }

        self.check_body(&body).map_err(|_| {
            Error::corruption(lsn, format!("{:?} record has a {} byte body", self, body.len()))
        })?;

        Ok(body)
    }

    /// Stored length of a fixed or pseudo-fixed record whose data starts
    /// `data`. `None` for variable-length kinds or truncated data.
    pub(crate) fn stored_fixed_len(self, data: &[u8]) -> Option<usize> {
        match self.class() {
            RecordClass::Fixed { len } => Some(len),
            RecordClass::PseudoFixed { len, lsns } => {
                let mut at = 0;
                for _ in 0..lsns {
                    at += encoded_diff_size(data.get(at..)?)?;
                }
                Some(at + len - lsns * LSN_STORE_SIZE)
            }
            RecordClass::Variable { .. } => None,
        }
    }

    /// Keeps the transaction's LSN bookkeeping current. Runs under the log
    /// lock right after the record's LSN is assigned.
    pub fn write_hook(self, lsn: Lsn, trn: &mut Transaction, body: &[u8]) {
        use RecordKind::*;
        match self {
            LongTransactionId => trn.long_id_logged = true,
            RedoInsertRow | RedoDeleteRow => {
                if trn.rec_lsn.is_impossible() {
                    trn.rec_lsn = lsn;
                }
            }
            UndoRowInsert | UndoRowDelete => {
                trn.undo_lsn = lsn;
                if trn.first_undo_lsn.is_impossible() {
                    trn.first_undo_lsn = lsn;
                }
            }
            ClrEnd => {
                let previous = Lsn::load(body);
                trn.undo_lsn = previous;
                if previous.is_impossible() {
                    trn.first_undo_lsn = Lsn::IMPOSSIBLE;
                }
            }
            Commit | CommitWithUndoPurge => trn.commit_lsn = lsn,
            Checkpoint | Prepare | FileId | DebugInfo => {}
        }
    }
}

/// Per-transaction state the log keeps current as records are written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    /// Written into the chunk header of every record of the transaction.
    pub short_id: u16,
    /// 6-byte global id, 0 for none. Logged once, in front of the first
    /// record of the transaction.
    pub long_id: u64,
    /// First redo record.
    pub rec_lsn: Lsn,
    /// Latest undo record.
    pub undo_lsn: Lsn,
    /// First undo record.
    pub first_undo_lsn: Lsn,
    pub commit_lsn: Lsn,
    long_id_logged: bool,
}

impl Transaction {
    pub fn new(short_id: u16, long_id: u64) -> Transaction {
        assert!(long_id < 1 << 48, "long transaction ids are 6 bytes");
        Transaction { short_id, long_id, ..Transaction::default() }
    }

    /// The transaction non-transactional records are written under.
    pub fn system() -> Transaction {
        Transaction::default()
    }

    pub fn long_id_logged(&self) -> bool {
        self.long_id_logged
    }

    pub(crate) fn needs_long_id(&self) -> bool {
        self.long_id != 0 && !self.long_id_logged
    }

    pub(crate) fn long_id_body(&self) -> [u8; LONG_TRANSACTION_ID_LEN] {
        let mut body = [0; LONG_TRANSACTION_ID_LEN];
        body.copy_from_slice(&self.long_id.to_le_bytes()[..LONG_TRANSACTION_ID_LEN]);
        body
    }
}

/// A record read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub lsn: Lsn,
    pub kind: RecordKind,
    pub short_trid: u16,
    pub body: Vec<u8>,
}

impl Record {
    /// The `i`th LSN stored at the front of the body.
    pub fn lsn_ref(&self, i: usize) -> Option<Lsn> {
        if i >= self.kind.compressed_lsns() {
            return None;
        }
        self.body.get(i * LSN_STORE_SIZE..(i + 1) * LSN_STORE_SIZE).map(Lsn::load)
    }
}
