use std::fmt::{Display, Formatter};
use anyhow::bail;

/// Sequence number of a data packet. Sequence numbers are strictly positive and assigned in
///  emission order, starting at 1.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SeqNr(u64);

impl Display for SeqNr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNr {
    pub const FIRST: SeqNr = SeqNr(1);

    pub fn new(value: u64) -> anyhow::Result<SeqNr> {
        if value == 0 {
            bail!("sequence numbers start at 1");
        }
        Ok(SeqNr(value))
    }

    /// for code paths that construct numbers from other, already valid numbers
    pub fn from_raw(value: u64) -> SeqNr {
        debug_assert!(value > 0);
        SeqNr(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> SeqNr {
        SeqNr(self.0.saturating_add(1))
    }

    pub fn checked_minus(&self, other: u64) -> Option<SeqNr> {
        match self.0.checked_sub(other) {
            Some(0) | None => None,
            Some(raw) => Some(SeqNr(raw)),
        }
    }

    /// iterates from self (inclusive) to `end` (exclusive)
    pub fn to(&self, end: SeqNr) -> impl Iterator<Item=SeqNr> {
        (self.0..end.0).map(SeqNr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_new_rejects_zero() {
        assert!(SeqNr::new(0).is_err());
        assert_eq!(SeqNr::new(1).unwrap(), SeqNr::FIRST);
    }

    #[rstest]
    #[case::regular(5, 2, Some(3))]
    #[case::to_first(5, 4, Some(1))]
    #[case::to_zero(5, 5, None)]
    #[case::below_zero(5, 6, None)]
    fn test_checked_minus(#[case] value: u64, #[case] minus: u64, #[case] expected: Option<u64>) {
        assert_eq!(SeqNr::from_raw(value).checked_minus(minus), expected.map(SeqNr::from_raw));
    }

    #[rstest]
    #[case::empty(3, 3, vec![])]
    #[case::reversed(4, 3, vec![])]
    #[case::single(3, 4, vec![3])]
    #[case::several(3, 6, vec![3, 4, 5])]
    fn test_to(#[case] from: u64, #[case] to: u64, #[case] expected: Vec<u64>) {
        let actual = SeqNr::from_raw(from).to(SeqNr::from_raw(to))
            .map(|s| s.to_raw())
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }
}
