//! Shared primitives for the consensus stack.
//!
//! This crate holds the pieces every other crate depends on: the
//! deterministic [`Clock`] abstraction and the cluster [`Member`] model.
//! Nothing here is protocol-aware; wire types live in `protocol` and
//! storage types in `storage`.

pub mod clock;
pub mod member;

pub use clock::{Clock, MockClock, SystemClock};
pub use member::{Member, MemberId, MemberKind, MemberStatus, Members};
