use crate::model::*;

/// Every overlap between a slot on the `left` side and a slot on the `right`
/// side held by a different actor.
///
/// Sweep over both sides sorted by start. Each side keeps an active set of
/// slots that may still overlap later starts; a slot is paired with every
/// live entry on the other side when it is reached. Slots of one side may
/// overlap each other, so the active sets are lists rather than cursors.
///
/// Identical `(span, actor pair)` results collapse to one. Output is sorted.
pub fn find_overlaps(resource_id: ResourceId, left: &[Slot], right: &[Slot]) -> Vec<MatchResult> {
    let mut items: Vec<(&Slot, bool)> = left
        .iter()
        .map(|s| (s, false))
        .chain(right.iter().map(|s| (s, true)))
        .collect();
    items.sort_by_key(|(s, _)| (s.span.start, s.span.end));

    let mut active: [Vec<&Slot>; 2] = [Vec::new(), Vec::new()];
    let mut out = Vec::new();

    for (slot, is_right) in items {
        let t = slot.span.start;
        active[0].retain(|s| s.span.end > t);
        active[1].retain(|s| s.span.end > t);

        let other = usize::from(!is_right);
        for o in &active[other] {
            if o.actor_id == slot.actor_id {
                continue;
            }
            if let Some(span) = slot.span.intersection(&o.span) {
                out.push(MatchResult::new(resource_id, span, slot.actor_id, o.actor_id));
            }
        }
        active[usize::from(is_right)].push(slot);
    }

    out.sort_by_key(|m| (m.span.start, m.span.end, m.actors));
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    const JUNE_3: Ms = 1_717_372_800_000;

    fn slot(actor_id: ActorId, role: Role, start: Ms, end: Ms) -> Slot {
        Slot {
            id: Ulid::new(),
            resource_id: 1,
            actor_id,
            role,
            span: Span::new(start, end),
            created_at: 0,
        }
    }

    fn owner(actor: ActorId, start: Ms, end: Ms) -> Slot {
        slot(actor, Role::Owner, start, end)
    }

    fn buyer(actor: ActorId, start: Ms, end: Ms) -> Slot {
        slot(actor, Role::Counterpart, start, end)
    }

    #[test]
    fn partial_overlap_yields_intersection() {
        let a = [owner(1, JUNE_3 + 9 * H, JUNE_3 + 9 * H + 30 * M)];
        let b = [buyer(2, JUNE_3 + 9 * H, JUNE_3 + 10 * H)];
        let matches = find_overlaps(1, &a, &b);
        assert_eq!(
            matches,
            vec![MatchResult::new(
                1,
                Span::new(JUNE_3 + 9 * H, JUNE_3 + 9 * H + 30 * M),
                1,
                2
            )]
        );
    }

    #[test]
    fn symmetric() {
        let a = [owner(1, 0, 100), owner(1, 200, 300), owner(1, 250, 400)];
        let b = [buyer(2, 50, 260), buyer(2, 390, 500)];
        assert_eq!(find_overlaps(1, &a, &b), find_overlaps(1, &b, &a));
        assert_eq!(find_overlaps(1, &a, &b).len(), 4);
    }

    #[test]
    fn adjacent_is_not_a_match() {
        let a = [owner(1, 0, 100)];
        let b = [buyer(2, 100, 200)];
        assert!(find_overlaps(1, &a, &b).is_empty());
    }

    #[test]
    fn empty_sides() {
        let a = [owner(1, 0, 100)];
        assert!(find_overlaps(1, &a, &[]).is_empty());
        assert!(find_overlaps(1, &[], &a).is_empty());
    }

    #[test]
    fn same_actor_never_matches_itself() {
        let a = [owner(1, 0, 100)];
        let b = [buyer(1, 0, 100)];
        assert!(find_overlaps(1, &a, &b).is_empty());
    }

    #[test]
    fn self_overlapping_slots_pair_with_everything() {
        // A long slot followed by a short one nested inside it: a cursor
        // sweep would lose the long slot once it advances past it.
        let a = [owner(1, 0, 1000), owner(1, 100, 200)];
        let b = [buyer(2, 500, 600)];
        assert_eq!(
            find_overlaps(1, &a, &b),
            vec![MatchResult::new(1, Span::new(500, 600), 1, 2)]
        );

        let b = [buyer(2, 150, 600)];
        assert_eq!(
            find_overlaps(1, &a, &b),
            vec![
                MatchResult::new(1, Span::new(150, 200), 1, 2),
                MatchResult::new(1, Span::new(150, 600), 1, 2),
            ]
        );
    }

    #[test]
    fn identical_results_collapse() {
        let a = [owner(1, 0, 100), owner(1, 0, 100)];
        let b = [buyer(2, 50, 150)];
        assert_eq!(
            find_overlaps(1, &a, &b),
            vec![MatchResult::new(1, Span::new(50, 100), 1, 2)]
        );
    }

    #[test]
    fn many_actors_per_side() {
        let owners = [owner(1, 0, 100), owner(3, 50, 150)];
        let buyers = [buyer(2, 90, 120), buyer(4, 0, 10)];
        let matches = find_overlaps(9, &owners, &buyers);
        assert_eq!(
            matches,
            vec![
                MatchResult::new(9, Span::new(0, 10), 1, 4),
                MatchResult::new(9, Span::new(90, 100), 1, 2),
                MatchResult::new(9, Span::new(90, 120), 2, 3),
            ]
        );
    }
}
