//! Cluster member model.
//!
//! Members come in three kinds: active members vote and count towards the
//! quorum, passive members replicate but never vote, and client members
//! neither vote nor replicate. The quorum is always computed over the
//! active set alone.

use std::fmt;

/// Unique identifier of a cluster member.
pub type MemberId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Active,
    Passive,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Dead,
}

/// A single cluster member: identity plus the address peers dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub host: String,
    pub port: u16,
    pub kind: MemberKind,
}

impl Member {
    pub fn new(id: MemberId, host: impl Into<String>, port: u16, kind: MemberKind) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            kind,
        }
    }

    /// The dialable address, `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member[id={}, address={}]", self.id, self.address())
    }
}

/// An ordered collection of members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Members {
    members: Vec<Member>,
}

impl Members {
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    pub fn get(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Votes required to win an election or commit an entry.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn push(&mut self, member: Member) {
        self.members.push(member);
    }

    pub fn remove(&mut self, id: MemberId) -> Option<Member> {
        let position = self.members.iter().position(|m| m.id == id)?;
        Some(self.members.remove(position))
    }

    pub fn to_vec(&self) -> Vec<Member> {
        self.members.clone()
    }
}

impl From<Vec<Member>> for Members {
    fn from(members: Vec<Member>) -> Self {
        Self::new(members)
    }
}

impl IntoIterator for Members {
    type Item = Member;
    type IntoIter = std::vec::IntoIter<Member>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: MemberId) -> Member {
        Member::new(id, "localhost", 5000 + id as u16, MemberKind::Active)
    }

    #[test]
    fn should_compute_quorum_for_odd_cluster() {
        // given
        let members = Members::new(vec![member(1), member(2), member(3)]);

        // then
        assert_eq!(members.quorum(), 2);
    }

    #[test]
    fn should_compute_quorum_for_even_cluster() {
        // given
        let members = Members::new(vec![member(1), member(2), member(3), member(4)]);

        // then
        assert_eq!(members.quorum(), 3);
    }

    #[test]
    fn should_compute_quorum_for_single_member() {
        // given
        let members = Members::new(vec![member(1)]);

        // then
        assert_eq!(members.quorum(), 1);
    }

    #[test]
    fn should_find_member_by_id() {
        // given
        let members = Members::new(vec![member(1), member(2)]);

        // then
        assert_eq!(members.get(2).map(|m| m.port), Some(5002));
        assert!(members.get(9).is_none());
    }

    #[test]
    fn should_remove_member_by_id() {
        // given
        let mut members = Members::new(vec![member(1), member(2)]);

        // when
        let removed = members.remove(1);

        // then
        assert_eq!(removed.map(|m| m.id), Some(1));
        assert_eq!(members.len(), 1);
        assert!(!members.contains(1));
    }
}
