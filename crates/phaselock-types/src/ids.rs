//! Identifier newtypes.
//!
//! Snapshots are addressed by their creation index, blobs by the hex of
//! their BLAKE3 content hash, and ledger submissions by the opaque
//! reference the ledger hands back. Nodes get a UUID v7 so their rows sort
//! by start time.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around a `String` identifier.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }
    };
}

define_string_id! {
    /// Content address of a blob: lowercase hex of its BLAKE3 hash.
    ContentId
}

define_string_id! {
    /// Opaque transaction reference returned by a ledger submission.
    TxRef
}

impl ContentId {
    /// Compute the content address of `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }
}

/// Creation index of a checkpoint snapshot.
///
/// Indices are assigned in capture order starting at zero and are never
/// reused by a manager, so a larger id always means a later capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    /// Return the raw creation index.
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// The index following this one, saturating at `u64::MAX`.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl core::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a running lattice node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Create a new identifier using UUID v7 (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Return the inner [`Uuid`] value.
    pub const fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn content_id_is_blake3_hex() {
        let id = ContentId::of(b"hello");
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id, ContentId::of(b"hello"));
        assert_ne!(id, ContentId::of(b"hello!"));
    }

    #[test]
    fn snapshot_ids_order_by_creation() {
        let first = SnapshotId(0);
        assert!(first.next() > first);
        assert_eq!(SnapshotId(u64::MAX).next(), SnapshotId(u64::MAX));
    }

    #[test]
    fn string_ids_serialize_transparently() {
        let tx = TxRef::from("0xabc");
        assert_eq!(serde_json::to_string(&tx).unwrap(), "\"0xabc\"");
    }

    #[test]
    fn node_ids_are_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
    }
}
