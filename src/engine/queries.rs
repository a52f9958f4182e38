use ulid::Ulid;

use crate::model::*;

use super::Engine;
use super::matching::find_overlaps;

impl Engine {
    pub async fn get_slot(&self, id: Ulid) -> Option<Slot> {
        let rs = self.get_resource(&self.resource_of(&id)?)?;
        let guard = rs.read().await;
        guard.get(id).cloned()
    }

    /// Live slots on a resource, optionally for one actor, by start time.
    pub async fn list_by_resource(
        &self,
        resource_id: ResourceId,
        actor_id: Option<ActorId>,
    ) -> Vec<Slot> {
        let Some(rs) = self.get_resource(&resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard
            .slots
            .iter()
            .filter(|s| actor_id.is_none_or(|a| s.actor_id == a))
            .cloned()
            .collect()
    }

    /// One actor's slots across every resource, by start time.
    pub async fn list_by_actor(&self, actor_id: ActorId) -> Vec<Slot> {
        // Clone the handles first: no DashMap shard guard may live across an await.
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            out.extend(guard.actor_slots(actor_id).cloned());
        }
        out.sort_by_key(|s| (s.span.start, s.span.end, s.resource_id));
        out
    }

    /// Where `actor_a` and `actor_b` are both available on a resource.
    ///
    /// Works on a snapshot taken under the read lock; the lock is released
    /// before the sweep, so results are advisory.
    pub async fn find_matches(
        &self,
        resource_id: ResourceId,
        actor_a: ActorId,
        actor_b: ActorId,
    ) -> Vec<MatchResult> {
        if actor_a == actor_b {
            return Vec::new();
        }
        let Some(rs) = self.get_resource(&resource_id) else {
            return Vec::new();
        };
        let (left, right): (Vec<Slot>, Vec<Slot>) = {
            let guard = rs.read().await;
            (
                guard.actor_slots(actor_a).cloned().collect(),
                guard.actor_slots(actor_b).cloned().collect(),
            )
        };
        find_overlaps(resource_id, &left, &right)
    }

    /// Every owner/counterpart overlap on a resource.
    pub async fn find_resource_matches(&self, resource_id: ResourceId) -> Vec<MatchResult> {
        let Some(rs) = self.get_resource(&resource_id) else {
            return Vec::new();
        };
        let (owners, counterparts): (Vec<Slot>, Vec<Slot>) = {
            let guard = rs.read().await;
            guard
                .slots
                .iter()
                .cloned()
                .partition(|s| s.role == Role::Owner)
        };
        find_overlaps(resource_id, &owners, &counterparts)
    }
}
