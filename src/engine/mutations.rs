use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::normalize::{RawSlot, normalize};
use crate::recurrence::WeeklyPattern;

use super::guard::{check, validate_span};
use super::{Decision, Engine, EngineError, WalCommand};

/// Result of `toggle_slot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toggle {
    Added(Slot),
    Removed(Slot),
}

/// What inserting one span into a resource amounts to.
struct Placement {
    slot: Slot,
    /// Live slots the new one absorbs (merge policy).
    absorbed: Vec<Ulid>,
}

impl Engine {
    /// Run the guard for one span against the actor's live slots on `rs`,
    /// ignoring `skip` (the slot being replaced, if any).
    fn place(
        &self,
        rs: &ResourceState,
        actor_id: ActorId,
        role: Role,
        span: Span,
        skip: Option<Ulid>,
    ) -> Result<Placement, EngineError> {
        let mine: Vec<(Ulid, Span)> = rs
            .actor_slots(actor_id)
            .filter(|s| Some(s.id) != skip)
            .map(|s| (s.id, s.span))
            .collect();
        let spans: Vec<Span> = mine.iter().map(|(_, s)| *s).collect();

        let (span, absorbed) = match check(&span, &spans, self.config.policy) {
            Decision::Accept => (span, Vec::new()),
            Decision::Reject { kind, index } => {
                return Err(EngineError::Conflict {
                    kind,
                    existing: mine[index].0,
                });
            }
            Decision::Merge { span, absorbed } => {
                // Coalescing can grow a slot past the width limit.
                validate_span(&span)?;
                (span, absorbed.into_iter().map(|i| mine[i].0).collect())
            }
        };
        Ok(Placement {
            slot: new_slot(rs.id, actor_id, role, span),
            absorbed,
        })
    }

    /// Create one slot. Under the merge policy the returned slot is the
    /// coalesced one and the absorbed slots are gone.
    pub async fn create_slot(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        role: Role,
        span: Span,
    ) -> Result<Slot, EngineError> {
        validate_span(&span)?;
        let guard = self.lock_resource(resource_id).await?;
        if guard.slots.len() >= MAX_SLOTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many slots on resource"));
        }

        let Placement { slot, absorbed } = self.place(&guard, actor_id, role, span, None)?;
        let event = Event::SlotsCreated {
            resource_id,
            slots: vec![slot.clone()],
            replaced: absorbed,
        };
        self.commit(guard, event).await?;
        tracing::debug!(slot = %slot.id, resource_id, actor_id, "slot created");
        Ok(slot)
    }

    /// Normalize raw client input, then `create_slot`.
    pub async fn create_from_input(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        role: Role,
        raw: &RawSlot,
    ) -> Result<Slot, EngineError> {
        let span = normalize(raw, &self.config.grid)?;
        self.create_slot(actor_id, resource_id, role, span).await
    }

    /// Create many slots for one actor on one resource, all or nothing.
    ///
    /// Each span is checked against the actor's live slots and against the
    /// spans accepted before it in the same batch. On a rejection the
    /// reported `existing` id may be that of an earlier batch member, which
    /// was never persisted.
    pub async fn create_slots(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        role: Role,
        spans: Vec<Span>,
    ) -> Result<Vec<Slot>, EngineError> {
        if spans.is_empty() {
            return Ok(Vec::new());
        }
        if spans.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for span in &spans {
            validate_span(span)?;
        }

        let guard = self.lock_resource(resource_id).await?;
        if guard.slots.len() + spans.len() > MAX_SLOTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many slots on resource"));
        }

        // The actor's view as the batch builds up: live slots plus accepted members.
        let mut working: Vec<(Ulid, Span)> =
            guard.actor_slots(actor_id).map(|s| (s.id, s.span)).collect();
        let mut created: Vec<Slot> = Vec::with_capacity(spans.len());
        let mut replaced: Vec<Ulid> = Vec::new();

        for span in spans {
            let existing: Vec<Span> = working.iter().map(|(_, s)| *s).collect();
            let span = match check(&span, &existing, self.config.policy) {
                Decision::Accept => span,
                Decision::Reject { kind, index } => {
                    return Err(EngineError::Conflict {
                        kind,
                        existing: working[index].0,
                    });
                }
                Decision::Merge { span, absorbed } => {
                    validate_span(&span)?;
                    for &i in absorbed.iter().rev() {
                        let (id, _) = working.remove(i);
                        match created.iter().position(|s| s.id == id) {
                            Some(pos) => {
                                created.remove(pos);
                            }
                            None => replaced.push(id),
                        }
                    }
                    span
                }
            };
            let slot = new_slot(resource_id, actor_id, role, span);
            working.push((slot.id, span));
            created.push(slot);
        }

        let event = Event::SlotsCreated {
            resource_id,
            slots: created.clone(),
            replaced,
        };
        self.commit(guard, event).await?;
        tracing::debug!(resource_id, actor_id, count = created.len(), "slot batch created");
        Ok(created)
    }

    /// Expand a weekly pattern from `today` and store every cell as one batch.
    pub async fn create_recurring(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        role: Role,
        pattern: &WeeklyPattern,
        today: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        if pattern.week_count > MAX_WEEK_COUNT {
            return Err(EngineError::LimitExceeded("week_count too large"));
        }
        let spans = pattern.expand(today, &self.config.grid)?;
        self.create_slots(actor_id, resource_id, role, spans).await
    }

    /// Remove the actor's slot with exactly this span if there is one,
    /// otherwise create it.
    pub async fn toggle_slot(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        role: Role,
        span: Span,
    ) -> Result<Toggle, EngineError> {
        validate_span(&span)?;
        let guard = self.lock_resource(resource_id).await?;

        let found = guard.actor_slots(actor_id).find(|s| s.span == span).cloned();
        if let Some(existing) = found {
            let event = Event::SlotsDeleted {
                resource_id,
                ids: vec![existing.id],
            };
            self.commit(guard, event).await?;
            tracing::debug!(slot = %existing.id, resource_id, actor_id, "slot toggled off");
            return Ok(Toggle::Removed(existing));
        }

        if guard.slots.len() >= MAX_SLOTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many slots on resource"));
        }
        let Placement { slot, absorbed } = self.place(&guard, actor_id, role, span, None)?;
        let event = Event::SlotsCreated {
            resource_id,
            slots: vec![slot.clone()],
            replaced: absorbed,
        };
        self.commit(guard, event).await?;
        tracing::debug!(slot = %slot.id, resource_id, actor_id, "slot toggled on");
        Ok(Toggle::Added(slot))
    }

    /// Move a slot to a new span. The old slot is retired and a new one (with
    /// a new id) is created in the same WAL record.
    pub async fn replace_slot(&self, id: Ulid, span: Span) -> Result<Slot, EngineError> {
        validate_span(&span)?;
        let resource_id = self.resource_of(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.lock_for_write(rs).await?;
        // Deleted while we waited for the lock.
        let old = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;

        let Placement { slot, mut absorbed } =
            self.place(&guard, old.actor_id, old.role, span, Some(id))?;
        absorbed.insert(0, id);
        let event = Event::SlotsCreated {
            resource_id,
            slots: vec![slot.clone()],
            replaced: absorbed,
        };
        self.commit(guard, event).await?;
        tracing::debug!(old = %id, new = %slot.id, resource_id, "slot replaced");
        Ok(slot)
    }

    pub async fn delete_slot(&self, id: Ulid) -> Result<Slot, EngineError> {
        let resource_id = self.resource_of(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.lock_for_write(rs).await?;
        let slot = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;

        let event = Event::SlotsDeleted {
            resource_id,
            ids: vec![id],
        };
        self.commit(guard, event).await?;
        tracing::debug!(slot = %id, resource_id, "slot deleted");
        Ok(slot)
    }

    /// Delete every slot on a resource, or only one actor's. Returns what was
    /// removed; an unknown resource simply has nothing to remove.
    pub async fn delete_by_resource(
        &self,
        resource_id: ResourceId,
        actor_id: Option<ActorId>,
    ) -> Result<Vec<Slot>, EngineError> {
        let Some(rs) = self.get_resource(&resource_id) else {
            return Ok(Vec::new());
        };
        let guard = self.lock_for_write(rs).await?;
        let removed: Vec<Slot> = guard
            .slots
            .iter()
            .filter(|s| actor_id.is_none_or(|a| s.actor_id == a))
            .cloned()
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }

        let event = Event::SlotsDeleted {
            resource_id,
            ids: removed.iter().map(|s| s.id).collect(),
        };
        self.commit(guard, event).await?;
        tracing::debug!(resource_id, ?actor_id, count = removed.len(), "slots deleted");
        Ok(removed)
    }

    /// Rewrite the WAL down to one record per non-empty resource.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        self.wal_control(|response| WalCommand::Compact { response })
            .await?
            .map(|_| ())
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal_control(|response| WalCommand::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

fn new_slot(resource_id: ResourceId, actor_id: ActorId, role: Role, span: Span) -> Slot {
    Slot {
        id: Ulid::new(),
        resource_id,
        actor_id,
        role,
        span,
        created_at: now_ms(),
    }
}
