//! Endpoint identity: `(group, rank, tag)`.
//!
//! Group/rank resolution lives in the group-membership service, out of
//! scope here (spec §1); this crate only needs `Endpoint` to be hashable
//! and comparable so it can key the per-context [`crate::epi::EpiTable`].

use std::fmt;
use std::sync::Arc;

/// Opaque process-group identifier, as handed back by the membership
/// service. Cheaply cloneable since every tracked request carries one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupId(Arc<str>);

impl GroupId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        GroupId(id.into())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        GroupId::new(s)
    }
}

pub type Rank = u32;
pub type Tag = u32;

/// Target of an RPC: a rank within a group, plus a tag distinguishing
/// logical channels to that rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub group: GroupId,
    pub rank: Rank,
    pub tag: Tag,
}

impl Endpoint {
    pub fn new(group: GroupId, rank: Rank, tag: Tag) -> Self {
        Endpoint { group, rank, tag }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.group, self.rank, self.tag)
    }
}

/// Opaque RPC opcode. `Opcode(OPCODE_URI_LOOKUP)` is reserved for the
/// address-resolution sub-protocol (spec §4.5): requests with this opcode
/// bypass EPI tracking entirely.
pub type Opcode = u32;

/// Reserved opcode for the URI-lookup sub-protocol. Chosen to sit outside
/// the range an RPC protocol registry would hand out to real handlers.
pub const OPCODE_URI_LOOKUP: Opcode = u32::MAX;
