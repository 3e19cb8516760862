//! Newtype domain identifiers.
//!
//! Every concept with an identity is a distinct newtype wrapping a primitive, so
//! a [`WordId`] can never be passed where a [`WordSegmentId`] is expected even
//! though both are strings produced by the same model response.
//!
//! Canonical segment ids (`mn10:1.1`) come from the segment source. Word,
//! word-segment and relation ids are minted by the decomposition pass and are
//! only unique within one phase.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display, Borrow<str>.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is blank.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.trim().is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers — UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies one compilation run and the packet it produces.
///
/// Generated fresh for every call to the compiler; propagated through spans
/// so all activity from a single run can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketId(Uuid);

impl PacketId {
    /// Generates a new random packet identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`PacketId`] from an existing UUID (e.g. deserialised from storage).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers — String-backed (source addressing)
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a work within a provider's archive (e.g. `"mn10"`).
    ///
    /// Also the key of the rolling phase-duration table.
    WorkId
}

string_id! {
    /// Identifies one canonical segment (e.g. `"mn10:1.1"`).
    ///
    /// Unique within a compilation input; ordering is carried separately by
    /// [`crate::CanonicalSegment::order`].
    SegmentId
}

// ---------------------------------------------------------------------------
// Identifiers — String-backed (phase-local, model-minted)
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a study phase (`"p1"`, `"p2"`, …) after renumbering.
    PhaseId
}

impl PhaseId {
    /// The `n`-th phase id (`"p{n}"`).
    pub fn numbered(n: usize) -> Self {
        Self(format!("p{n}"))
    }
}

string_id! {
    /// Identifies a source-language word within a phase.
    WordId
}

impl WordId {
    /// The `n`-th minted word id (`"w{n}"`).
    pub fn numbered(n: usize) -> Self {
        Self(format!("w{n}"))
    }
}

string_id! {
    /// Identifies one morphological piece (root, prefix, suffix, stem) of a word.
    WordSegmentId
}

string_id! {
    /// Identifies a grammatical relation between a word segment and another
    /// word or word segment.
    RelationId
}
