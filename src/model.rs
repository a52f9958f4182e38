use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Opaque id of an actor (owned by an external identity service).
pub type ActorId = i64;

/// Opaque id of the thing availability is scheduled against (e.g. a property).
pub type ResourceId = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlapping or sharing an endpoint.
    pub fn touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// The common part of two spans, if any.
    pub fn intersection(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Span::new(start, end))
    }
}

/// Which side of the calendar an actor is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Resource owner ("seller").
    Owner,
    /// Prospective counterpart ("buyer").
    Counterpart,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Counterpart => "counterpart",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "owner" | "seller" => Ok(Role::Owner),
            "counterpart" | "buyer" => Ok(Role::Counterpart),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted availability interval for one actor on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub resource_id: ResourceId,
    pub actor_id: ActorId,
    pub role: Role,
    pub span: Span,
    pub created_at: Ms,
}

/// All live slots of a resource, across actors.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: ResourceId,
    /// Sorted by `span.start`; equal starts keep insertion order.
    pub slots: Vec<Slot>,
}

impl ResourceState {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            slots: Vec::new(),
        }
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .partition_point(|s| s.span.start <= slot.span.start);
        self.slots.insert(pos, slot);
    }

    /// Remove slot by id.
    pub fn remove_slot(&mut self, id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    /// Slots of one actor, in start order.
    pub fn actor_slots(&self, actor_id: ActorId) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter(move |s| s.actor_id == actor_id)
    }

    /// Apply one WAL event. Retired ids go first so a replace can reuse a span.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::SlotsCreated {
                slots, replaced, ..
            } => {
                for id in replaced {
                    self.remove_slot(*id);
                }
                for slot in slots {
                    self.insert_slot(slot.clone());
                }
            }
            Event::SlotsDeleted { ids, .. } => {
                for id in ids {
                    self.remove_slot(*id);
                }
            }
        }
    }
}

/// The event types. This is the WAL record format.
///
/// A record is the unit of atomicity: a batch, a merge or a replace is one
/// `SlotsCreated` carrying every slot it adds and every id it retires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotsCreated {
        resource_id: ResourceId,
        slots: Vec<Slot>,
        /// Ids removed in the same step (merged away or replaced).
        replaced: Vec<Ulid>,
    },
    SlotsDeleted {
        resource_id: ResourceId,
        ids: Vec<Ulid>,
    },
}

impl Event {
    pub fn resource_id(&self) -> ResourceId {
        match self {
            Event::SlotsCreated { resource_id, .. } | Event::SlotsDeleted { resource_id, .. } => {
                *resource_id
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A time range at which two different actors are both available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MatchResult {
    pub resource_id: ResourceId,
    pub span: Span,
    /// Sorted ascending, so the pair is order-independent.
    pub actors: [ActorId; 2],
}

impl MatchResult {
    pub fn new(resource_id: ResourceId, span: Span, a: ActorId, b: ActorId) -> Self {
        let actors = if a <= b { [a, b] } else { [b, a] };
        Self {
            resource_id,
            span,
            actors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(actor_id: ActorId, start: Ms, end: Ms) -> Slot {
        Slot {
            id: Ulid::new(),
            resource_id: 1,
            actor_id,
            role: Role::Owner,
            span: Span::new(start, end),
            created_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(a.touches(&c));
        assert!(!a.touches(&Span::new(201, 300)));
    }

    #[test]
    fn span_intersection() {
        let a = Span::new(100, 200);
        assert_eq!(a.intersection(&Span::new(150, 250)), Some(Span::new(150, 200)));
        assert_eq!(a.intersection(&Span::new(200, 250)), None);
        assert_eq!(a.intersection(&Span::new(0, 1000)), Some(a));
    }

    #[test]
    fn role_parsing_accepts_both_vocabularies() {
        assert_eq!("seller".parse::<Role>().unwrap(), Role::Owner);
        assert_eq!("OWNER".parse::<Role>().unwrap(), Role::Owner);
        assert_eq!("buyer".parse::<Role>().unwrap(), Role::Counterpart);
        assert_eq!(" counterpart ".parse::<Role>().unwrap(), Role::Counterpart);
        assert!("agent".parse::<Role>().is_err());
    }

    #[test]
    fn slot_ordering() {
        let mut rs = ResourceState::new(1);
        rs.insert_slot(slot(1, 300, 400));
        rs.insert_slot(slot(1, 100, 200));
        rs.insert_slot(slot(2, 200, 300));
        let starts: Vec<Ms> = rs.slots.iter().map(|s| s.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn equal_starts_keep_insertion_order() {
        let mut rs = ResourceState::new(1);
        let first = slot(1, 100, 200);
        let second = slot(2, 100, 300);
        rs.insert_slot(first.clone());
        rs.insert_slot(second.clone());
        assert_eq!(rs.slots[0].id, first.id);
        assert_eq!(rs.slots[1].id, second.id);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut rs = ResourceState::new(1);
        let slots: Vec<Slot> = (0..3).map(|i| slot(1, i * 100, i * 100 + 50)).collect();
        for s in &slots {
            rs.insert_slot(s.clone());
        }
        assert_eq!(rs.remove_slot(slots[1].id), Some(slots[1].clone()));
        assert_eq!(rs.slots.len(), 2);
        assert_eq!(rs.slots[0].id, slots[0].id);
        assert_eq!(rs.slots[1].id, slots[2].id);
        assert!(rs.remove_slot(slots[1].id).is_none());
    }

    #[test]
    fn actor_slots_filters() {
        let mut rs = ResourceState::new(1);
        rs.insert_slot(slot(1, 100, 200));
        rs.insert_slot(slot(2, 150, 250));
        rs.insert_slot(slot(1, 300, 400));
        let mine: Vec<Ms> = rs.actor_slots(1).map(|s| s.span.start).collect();
        assert_eq!(mine, vec![100, 300]);
    }

    #[test]
    fn apply_replaces_then_inserts() {
        let mut rs = ResourceState::new(1);
        let old = slot(1, 100, 200);
        rs.apply(&Event::SlotsCreated {
            resource_id: 1,
            slots: vec![old.clone()],
            replaced: vec![],
        });
        let new = slot(1, 100, 300);
        rs.apply(&Event::SlotsCreated {
            resource_id: 1,
            slots: vec![new.clone()],
            replaced: vec![old.id],
        });
        assert_eq!(rs.slots, vec![new.clone()]);
        rs.apply(&Event::SlotsDeleted {
            resource_id: 1,
            ids: vec![new.id],
        });
        assert!(rs.slots.is_empty());
    }

    #[test]
    fn match_result_orders_actor_pair() {
        let a = MatchResult::new(7, Span::new(0, 10), 9, 3);
        let b = MatchResult::new(7, Span::new(0, 10), 3, 9);
        assert_eq!(a, b);
        assert_eq!(a.actors, [3, 9]);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotsCreated {
            resource_id: 7,
            slots: vec![slot(3, 1000, 2000)],
            replaced: vec![Ulid::new()],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.resource_id(), 7);
    }
}
