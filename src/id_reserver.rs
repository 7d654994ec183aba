//! Dense integer id allocator backed by a bitmap.

use crate::error::{LogDevError, Result};

/// Allocates dense ids with uniqueness guaranteed at any instant.
/// Ids become available again after an explicit unreserve.
pub(crate) struct IdReserver {
    bits: Vec<u64>,
    capacity: u32,
}

impl IdReserver {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            bits: Vec::new(),
            capacity,
        }
    }

    /// Reserve the lowest available id.
    pub(crate) fn reserve(&mut self) -> Result<u32> {
        for word_idx in 0..((self.capacity as usize + 63) / 64) {
            if word_idx >= self.bits.len() {
                self.bits.resize(word_idx + 1, 0);
            }
            let word = self.bits[word_idx];
            if word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as u32;
            let id = word_idx as u32 * 64 + bit;
            if id >= self.capacity {
                break;
            }
            self.bits[word_idx] |= 1u64 << bit;
            return Ok(id);
        }
        Err(LogDevError::StoreIdsExhausted {
            capacity: self.capacity,
        })
    }

    /// Mark a specific id reserved. Used when rebuilding the set from a
    /// persisted superblock.
    pub(crate) fn reserve_id(&mut self, id: u32) -> Result<()> {
        if id >= self.capacity {
            return Err(LogDevError::StoreIdsExhausted {
                capacity: self.capacity,
            });
        }
        if self.is_reserved(id) {
            return Err(LogDevError::Superblock("duplicate store id"));
        }
        let word_idx = (id / 64) as usize;
        if word_idx >= self.bits.len() {
            self.bits.resize(word_idx + 1, 0);
        }
        self.bits[word_idx] |= 1u64 << (id % 64);
        Ok(())
    }

    /// Release an id back to the pool.
    pub(crate) fn unreserve(&mut self, id: u32) {
        debug_assert!(self.is_reserved(id), "unreserve of id {id} that is not reserved");
        if let Some(word) = self.bits.get_mut((id / 64) as usize) {
            *word &= !(1u64 << (id % 64));
        }
    }

    pub(crate) fn is_reserved(&self, id: u32) -> bool {
        self.bits
            .get((id / 64) as usize)
            .map_or(false, |word| word & (1u64 << (id % 64)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_is_dense() {
        let mut reserver = IdReserver::new(8);
        for expected in 0..8 {
            assert_eq!(reserver.reserve().unwrap(), expected);
        }
        assert!(reserver.reserve().is_err());
    }

    #[test]
    fn test_unreserve_allows_reuse() {
        let mut reserver = IdReserver::new(4);
        let a = reserver.reserve().unwrap();
        let _b = reserver.reserve().unwrap();
        reserver.unreserve(a);
        assert!(!reserver.is_reserved(a));
        assert_eq!(reserver.reserve().unwrap(), a);
    }

    #[test]
    fn test_reserve_id_rebuild() {
        let mut reserver = IdReserver::new(128);
        reserver.reserve_id(0).unwrap();
        reserver.reserve_id(70).unwrap();
        assert!(reserver.reserve_id(70).is_err());
        assert!(reserver.is_reserved(70));

        // lowest free id is still handed out
        assert_eq!(reserver.reserve().unwrap(), 1);
    }

    #[test]
    fn test_capacity_spanning_words() {
        let mut reserver = IdReserver::new(130);
        for expected in 0..130 {
            assert_eq!(reserver.reserve().unwrap(), expected);
        }
        assert!(reserver.reserve().is_err());
        reserver.unreserve(129);
        assert_eq!(reserver.reserve().unwrap(), 129);
    }
}
