//! Cluster membership view.
//!
//! Holds the configured member lists (active and passive, including the
//! local member when listed) plus per-remote replication state. The view is
//! replaced wholesale by each applied Configuration entry; the version is
//! the index of that entry. Replication progress survives reconfiguration
//! for members that remain.

use std::collections::HashMap;

use common::{Member, MemberId, MemberKind, MemberStatus, Members};
use storage::Index;

/// Replication bookkeeping for one remote member.
#[derive(Debug, Clone)]
pub(crate) struct MemberState {
    pub member: Member,
    /// Next log index to send to this member.
    pub next_index: Index,
    /// Highest log index known replicated on this member.
    pub match_index: Index,
    pub status: MemberStatus,
}

impl MemberState {
    fn new(member: Member) -> Self {
        Self {
            member,
            next_index: 1,
            match_index: 0,
            status: MemberStatus::Alive,
        }
    }
}

pub(crate) struct ClusterState {
    /// The local server's configured identity; `kind` is the kind it wants
    /// to end up as, not necessarily its current membership.
    local: Member,
    version: Index,
    active: Vec<Member>,
    passive: Vec<Member>,
    remotes: HashMap<MemberId, MemberState>,
}

impl ClusterState {
    pub(crate) fn new(local: Member) -> Self {
        Self {
            local,
            version: 0,
            active: Vec::new(),
            passive: Vec::new(),
            remotes: HashMap::new(),
        }
    }

    pub(crate) fn local(&self) -> &Member {
        &self.local
    }

    pub(crate) fn version(&self) -> Index {
        self.version
    }

    /// Replaces both member sets. Stale versions are ignored; version 0 is
    /// the seeded initial configuration.
    pub(crate) fn configure(&mut self, version: Index, active: Vec<Member>, passive: Vec<Member>) {
        if version < self.version {
            return;
        }
        self.version = version;

        let mut remotes = HashMap::new();
        for member in active.iter().chain(passive.iter()) {
            if member.id == self.local.id {
                continue;
            }
            let state = self
                .remotes
                .remove(&member.id)
                .map(|mut s| {
                    s.member = member.clone();
                    s
                })
                .unwrap_or_else(|| MemberState::new(member.clone()));
            remotes.insert(member.id, state);
        }
        self.active = active;
        self.passive = passive;
        self.remotes = remotes;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.iter().any(|m| m.id == self.local.id)
    }

    pub(crate) fn is_passive(&self) -> bool {
        self.passive.iter().any(|m| m.id == self.local.id)
    }

    pub(crate) fn is_member(&self) -> bool {
        self.is_active() || self.is_passive()
    }

    /// Votes needed for elections and commitment, over the active set.
    pub(crate) fn quorum(&self) -> usize {
        Members::new(self.active.clone()).quorum()
    }

    pub(crate) fn active_members(&self) -> Vec<Member> {
        self.active.clone()
    }

    pub(crate) fn passive_members(&self) -> Vec<Member> {
        self.passive.clone()
    }

    pub(crate) fn all_members(&self) -> Vec<Member> {
        self.active.iter().chain(self.passive.iter()).cloned().collect()
    }

    pub(crate) fn contains(&self, id: MemberId) -> bool {
        self.active.iter().chain(self.passive.iter()).any(|m| m.id == id)
    }

    pub(crate) fn member(&self, id: MemberId) -> Option<&Member> {
        self.active
            .iter()
            .chain(self.passive.iter())
            .find(|m| m.id == id)
    }

    pub(crate) fn address_of(&self, id: MemberId) -> Option<String> {
        self.member(id).map(|m| m.address())
    }

    pub(crate) fn remote_active_ids(&self) -> Vec<MemberId> {
        self.active
            .iter()
            .filter(|m| m.id != self.local.id)
            .map(|m| m.id)
            .collect()
    }

    pub(crate) fn remote_passive_ids(&self) -> Vec<MemberId> {
        self.passive
            .iter()
            .filter(|m| m.id != self.local.id)
            .map(|m| m.id)
            .collect()
    }

    pub(crate) fn state(&self, id: MemberId) -> Option<&MemberState> {
        self.remotes.get(&id)
    }

    pub(crate) fn state_mut(&mut self, id: MemberId) -> Option<&mut MemberState> {
        self.remotes.get_mut(&id)
    }

    /// Match indexes of the remote active members, for commit math.
    pub(crate) fn active_match_indexes(&self) -> Vec<Index> {
        self.remote_active_ids()
            .iter()
            .filter_map(|id| self.remotes.get(id))
            .map(|s| s.match_index)
            .collect()
    }

    /// Resets replication progress when this server becomes leader.
    pub(crate) fn reset_replication(&mut self, next_index: Index) {
        for state in self.remotes.values_mut() {
            state.next_index = next_index;
            state.match_index = 0;
            state.status = MemberStatus::Alive;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: MemberId, kind: MemberKind) -> Member {
        Member::new(id, "node", 7000 + id as u16, kind)
    }

    fn cluster_of_three() -> ClusterState {
        let mut cluster = ClusterState::new(member(1, MemberKind::Active));
        cluster.configure(
            0,
            vec![
                member(1, MemberKind::Active),
                member(2, MemberKind::Active),
                member(3, MemberKind::Active),
            ],
            vec![],
        );
        cluster
    }

    #[test]
    fn should_count_quorum_over_active_set() {
        // given
        let mut cluster = cluster_of_three();

        // then
        assert_eq!(cluster.quorum(), 2);

        // when a passive member joins
        cluster.configure(
            5,
            cluster.active_members(),
            vec![member(4, MemberKind::Passive)],
        );

        // then the quorum is unchanged
        assert_eq!(cluster.quorum(), 2);
        assert!(cluster.contains(4));
    }

    #[test]
    fn should_track_local_membership_kind() {
        // given
        let mut cluster = ClusterState::new(member(4, MemberKind::Active));
        assert!(!cluster.is_member());

        // when joined as passive
        cluster.configure(
            3,
            vec![member(1, MemberKind::Active)],
            vec![member(4, MemberKind::Passive)],
        );

        // then
        assert!(cluster.is_passive());
        assert!(!cluster.is_active());

        // when promoted
        cluster.configure(
            7,
            vec![member(1, MemberKind::Active), member(4, MemberKind::Active)],
            vec![],
        );
        assert!(cluster.is_active());
    }

    #[test]
    fn should_ignore_stale_configuration_versions() {
        // given
        let mut cluster = cluster_of_three();
        cluster.configure(9, vec![member(1, MemberKind::Active)], vec![]);

        // when an older configuration arrives
        cluster.configure(4, cluster_of_three().active_members(), vec![]);

        // then the newer one wins
        assert_eq!(cluster.version(), 9);
        assert!(!cluster.contains(2));
    }

    #[test]
    fn should_preserve_replication_state_across_reconfiguration() {
        // given
        let mut cluster = cluster_of_three();
        cluster.state_mut(2).unwrap().match_index = 42;

        // when
        cluster.configure(
            10,
            cluster.active_members(),
            vec![member(4, MemberKind::Passive)],
        );

        // then
        assert_eq!(cluster.state(2).unwrap().match_index, 42);
        assert_eq!(cluster.state(4).unwrap().match_index, 0);
    }

    #[test]
    fn should_reset_replication_on_leadership() {
        // given
        let mut cluster = cluster_of_three();
        cluster.state_mut(2).unwrap().match_index = 42;

        // when
        cluster.reset_replication(43);

        // then
        let state = cluster.state(2).unwrap();
        assert_eq!(state.next_index, 43);
        assert_eq!(state.match_index, 0);
    }
}
