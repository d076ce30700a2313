//! Provides `PrioBitmap`, a one-word bit array used to track which priority
//! levels currently have runnable tasks.
use super::Init;

/// A bit set over priority levels supporting a constant-time scan for the
/// most significant (= most urgent) set bit.
///
/// One `u32` word covers every supported priority level
/// ([`crate::MAX_PRIORITY_LEVELS`]` ≤ 32`).
pub trait PrioBitmap: Init + Send + Sync + Clone + Copy + core::fmt::Debug + 'static {
    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the position of the highest set bit.
    fn find_highest(&self) -> Option<usize>;
}

impl PrioBitmap for u32 {
    #[inline]
    fn get(&self, i: usize) -> bool {
        assert!(i < 32);
        (*self >> i) & 1 != 0
    }

    #[inline]
    fn clear(&mut self, i: usize) {
        assert!(i < 32);
        *self &= !(1u32 << i);
    }

    #[inline]
    fn set(&mut self, i: usize) {
        assert!(i < 32);
        *self |= 1u32 << i;
    }

    #[inline]
    fn find_highest(&self) -> Option<usize> {
        if *self == 0 {
            None
        } else {
            Some(31 - self.leading_zeros() as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty() {
        let m = 0u32;
        assert_eq!(m.find_highest(), None);
    }

    #[test]
    fn set_and_scan() {
        let mut m = 0u32;
        m.set(0);
        assert_eq!(m.find_highest(), Some(0));
        m.set(7);
        assert_eq!(m.find_highest(), Some(7));
        m.set(31);
        assert_eq!(m.find_highest(), Some(31));
        m.clear(31);
        assert_eq!(m.find_highest(), Some(7));
        m.clear(7);
        m.clear(0);
        assert_eq!(m.find_highest(), None);
    }

    #[quickcheck_macros::quickcheck]
    fn matches_reference_model(bits: Vec<u8>) -> bool {
        let mut m = 0u32;
        let mut model = std::collections::BTreeSet::new();
        for b in bits {
            let i = usize::from(b) % 32;
            if model.contains(&i) {
                m.clear(i);
                model.remove(&i);
            } else {
                m.set(i);
                model.insert(i);
            }
            if m.find_highest() != model.iter().next_back().copied() {
                return false;
            }
        }
        true
    }
}
