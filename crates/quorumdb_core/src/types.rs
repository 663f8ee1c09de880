//! Core identifiers.

use std::fmt;

/// Unique identifier for a transaction.
///
/// Transaction ids are monotonically increasing within a replica and never
/// reused. Id 0 is reserved for term barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Id carried by term barrier records.
    pub const BARRIER: Self = Self(0);

    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Commit sequence number: position of a record in the log (1-based).
///
/// It totally orders commits and doubles as the version of every key the
/// record writes. `CommitSeq::ZERO` means "before the first record".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CommitSeq(pub u64);

impl CommitSeq {
    /// The position before the first record.
    pub const ZERO: Self = Self(0);

    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the previous sequence number, saturating at zero.
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for CommitSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Version of an entry: the sequence of the record that last wrote it.
pub type Version = CommitSeq;

/// Leadership term. Strictly increases; at most one Primary per term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Term(pub u64);

impl Term {
    /// The term before any election.
    pub const ZERO: Self = Self(0);

    /// Creates a new term.
    #[must_use]
    pub const fn new(term: u64) -> Self {
        Self(term)
    }

    /// Returns the raw term value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next term.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "term:{}", self.0)
    }
}

/// Identifier of a replica within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(pub u32);

impl ReplicaId {
    /// Creates a new replica ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_seq_ordering() {
        let first = CommitSeq::new(1);
        assert!(CommitSeq::ZERO < first);
        assert_eq!(first.next(), CommitSeq::new(2));
        assert_eq!(first.prev(), CommitSeq::ZERO);
        assert_eq!(CommitSeq::ZERO.prev(), CommitSeq::ZERO);
    }

    #[test]
    fn display_formats() {
        assert_eq!(TransactionId::new(42).to_string(), "txn:42");
        assert_eq!(CommitSeq::new(7).to_string(), "seq:7");
        assert_eq!(Term::new(3).to_string(), "term:3");
        assert_eq!(ReplicaId::new(2).to_string(), "replica:2");
    }

    #[test]
    fn term_next_is_strictly_greater() {
        assert!(Term::ZERO.next() > Term::ZERO);
        assert_eq!(Term::new(5).next().as_u64(), 6);
    }
}
