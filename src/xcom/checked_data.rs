use std::collections::TryReserveError;

use serde::{Deserialize, Serialize};

/// An opaque application payload with an explicit length.
///
/// Payloads are never aliased across the cache boundary: every copy out of
/// the cache allocates fresh storage.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckedData {
    data: Vec<u8>,
}

impl CheckedData {
    /// Wraps `data`.
    pub fn new(data: Vec<u8>) -> CheckedData {
        CheckedData { data }
    }

    /// Length of the payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the payload bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consumes the payload, returning its bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// Copies the payload into freshly allocated storage, reporting
    /// allocation failure instead of aborting.
    pub fn try_clone_deep(&self) -> Result<CheckedData, TryReserveError> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.data.len())?;
        data.extend_from_slice(&self.data);
        Ok(CheckedData { data })
    }
}

/// Replaces `to` with a deep copy of `from`. `to` is left untouched if the
/// allocation fails.
pub fn copy_checked_data(to: &mut CheckedData, from: &CheckedData) -> Result<(), TryReserveError> {
    *to = from.try_clone_deep()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_copy_is_independent() {
        let mut original = CheckedData::new(b"payload".to_vec());
        let mut copy = CheckedData::default();
        copy_checked_data(&mut copy, &original).unwrap();

        original.as_mut_slice()[0] = b'P';
        assert_eq!(copy.as_slice(), b"payload");
        assert_eq!(copy.len(), 7);
        assert_ne!(copy.as_slice().as_ptr(), original.as_slice().as_ptr());
    }

    #[test]
    fn empty_copy() {
        let copy = CheckedData::default().try_clone_deep().unwrap();
        assert!(copy.is_empty());
    }
}
