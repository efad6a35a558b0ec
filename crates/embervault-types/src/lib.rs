//! # embervault-types: Core identifiers for the replica manager
//!
//! This crate contains the identifiers and wire-level types shared across
//! the replica manager:
//! - Server identity ([`ServerId`]), densely-indexed with a generation tag
//!   so a reused directory slot can never be confused with its predecessor
//! - The service bitmask ([`ServiceMask`]) advertised by a server entry
//! - Segment identity ([`SegmentId`])
//! - The wire form of a directory entry ([`ServerEntry`])

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// ServerId
// ============================================================================

/// Identifies a server in the cluster-wide directory.
///
/// Encoded as `(generation << 32) | index`. The index space is
/// densely reused as servers come and go; the generation distinguishes a
/// server occupying a given index from whatever previously occupied it.
/// Index `0` is reserved and never assigned. A generation of `0xFFFF_FFFF`
/// marks the [`ServerId::INVALID`] sentinel.
///
/// # Examples
///
/// ```
/// use embervault_types::ServerId;
///
/// let id = ServerId::new(7, 3);
/// assert_eq!(ServerId::from_u64(id.to_u64()), id);
/// assert!(id.is_valid());
/// assert!(!ServerId::INVALID.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId {
    index: u32,
    generation: u32,
}

impl ServerId {
    /// Generation value reserved to mark an invalid/absent server id.
    pub const INVALID_GENERATION: u32 = 0xFFFF_FFFF;

    /// The sentinel invalid id: index 0, generation all-ones.
    pub const INVALID: ServerId = ServerId {
        index: 0,
        generation: Self::INVALID_GENERATION,
    };

    /// Builds a server id from an index and generation.
    ///
    /// `index` must be nonzero for a valid id; the constructor does not
    /// enforce this so that `ServerId::new(0, g)` can express directory
    /// slot bookkeeping, but callers forming ids for real servers should
    /// never pass 0.
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// The dense index into the directory's backing vector.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// The generation tag distinguishing reuses of the same index.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// True unless this is [`ServerId::INVALID`] (or bears its generation).
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.generation != Self::INVALID_GENERATION
    }

    /// Packs this id into its 64-bit wire representation.
    #[must_use]
    pub const fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }

    /// Unpacks a 64-bit wire value into a `ServerId`.
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self {
            index: (value & 0xFFFF_FFFF) as u32,
            generation: (value >> 32) as u32,
        }
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}:{}", self.index, self.generation)
        } else {
            write!(f, "<invalid>")
        }
    }
}

impl From<u64> for ServerId {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl From<ServerId> for u64 {
    fn from(id: ServerId) -> Self {
        id.to_u64()
    }
}

// ============================================================================
// ServiceMask
// ============================================================================

/// Bitmask of services a directory entry offers.
///
/// Mirrors the `service_mask` field of [`ServerEntry`] on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ServiceMask(u32);

impl ServiceMask {
    /// Serves as a replication primary/source for segments it owns.
    pub const MASTER: ServiceMask = ServiceMask(1 << 0);
    /// Accepts segment replicas (open/write/free RPCs).
    pub const BACKUP: ServiceMask = ServiceMask(1 << 1);
    /// Participates in cluster-membership distribution.
    pub const MEMBERSHIP: ServiceMask = ServiceMask(1 << 2);
    /// Answers failure-detector pings.
    pub const PING: ServiceMask = ServiceMask(1 << 3);
    /// No services.
    pub const NONE: ServiceMask = ServiceMask(0);

    /// Builds a mask from a raw bit pattern.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw bit pattern.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every service in `other` is also offered by `self`.
    #[must_use]
    pub const fn contains(self, other: ServiceMask) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union of two masks.
    #[must_use]
    pub const fn union(self, other: ServiceMask) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for ServiceMask {
    type Output = ServiceMask;

    fn bitor(self, rhs: ServiceMask) -> ServiceMask {
        self.union(rhs)
    }
}

// ============================================================================
// SegmentId
// ============================================================================

/// Identifies an append-only log segment produced by a master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(u64);

impl SegmentId {
    /// Wraps a raw segment number.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw segment number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment-{}", self.0)
    }
}

impl From<u64> for SegmentId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// ServerEntry (wire form)
// ============================================================================

/// The wire form of a single server directory entry.
///
/// `segment_id` and `user_data` are opaque payload for higher layers;
/// the replica manager core never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Bitmask of services this server offers.
    pub service_mask: ServiceMask,
    /// Packed `ServerId` as a 64-bit wire value.
    pub server_id: u64,
    /// Opaque payload, meaningful only above the core.
    pub segment_id: u64,
    /// Network locator (e.g. `"host:port"`), transport-defined.
    pub locator: String,
    /// Opaque payload, meaningful only above the core.
    pub user_data: u64,
    /// Whether the coordinator currently considers this server a cluster
    /// member. `false` entries are in flight to removal.
    pub is_in_cluster: bool,
}

impl ServerEntry {
    /// Convenience accessor unpacking the wire `server_id` into a [`ServerId`].
    #[must_use]
    pub fn id(&self) -> ServerId {
        ServerId::from_u64(self.server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn invalid_is_not_valid() {
        assert!(!ServerId::INVALID.is_valid());
        assert!(!ServerId::default().is_valid());
    }

    #[test]
    fn service_mask_contains() {
        let mask = ServiceMask::BACKUP | ServiceMask::PING;
        assert!(mask.contains(ServiceMask::BACKUP));
        assert!(mask.contains(ServiceMask::PING));
        assert!(!mask.contains(ServiceMask::MASTER));
        assert!(mask.contains(ServiceMask::NONE));
    }

    proptest! {
        // A round-tripped id must compare equal to the original for any
        // index/generation pair, including the reserved INVALID sentinel.
        #[test]
        fn server_id_roundtrip(index: u32, generation: u32) {
            let id = ServerId::new(index, generation);
            prop_assert_eq!(ServerId::from_u64(id.to_u64()), id);
        }
    }
}
