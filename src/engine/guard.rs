use crate::limits::*;
use crate::model::*;
use crate::normalize::normalize_range;

use super::{ConflictKind, EngineError};

/// How a new slot is reconciled with the actor's existing slots on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// No duplicates, no overlaps.
    Strict,
    /// Only exact `(start, end)` duplicates are refused; overlapping slots
    /// stay independent, individually removable rows.
    #[default]
    DedupOnly,
    /// Overlapping or adjacent slots are coalesced into one.
    Merge,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "strict" => Ok(ConflictPolicy::Strict),
            "dedup_only" | "deduponly" | "dedup" => Ok(ConflictPolicy::DedupOnly),
            "merge" => Ok(ConflictPolicy::Merge),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConflictPolicy::Strict => "strict",
            ConflictPolicy::DedupOnly => "dedup_only",
            ConflictPolicy::Merge => "merge",
        })
    }
}

/// Outcome of checking one candidate against existing spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    /// `index` points at the offending entry of `existing`.
    Reject { kind: ConflictKind, index: usize },
    /// Replace the entries at `absorbed` with one slot covering `span`.
    Merge { span: Span, absorbed: Vec<usize> },
}

/// Check `candidate` against the same actor's live spans on the same resource.
pub fn check(candidate: &Span, existing: &[Span], policy: ConflictPolicy) -> Decision {
    if let Some(index) = existing.iter().position(|s| s == candidate) {
        return Decision::Reject {
            kind: ConflictKind::DuplicateSlot,
            index,
        };
    }
    match policy {
        ConflictPolicy::DedupOnly => Decision::Accept,
        ConflictPolicy::Strict => match existing.iter().position(|s| s.overlaps(candidate)) {
            Some(index) => Decision::Reject {
                kind: ConflictKind::OverlappingSlot,
                index,
            },
            None => Decision::Accept,
        },
        ConflictPolicy::Merge => coalesce(candidate, existing),
    }
}

/// Grow `candidate` over every touching span until nothing else touches.
fn coalesce(candidate: &Span, existing: &[Span]) -> Decision {
    let mut merged = *candidate;
    let mut absorbed: Vec<usize> = Vec::new();
    loop {
        let before = absorbed.len();
        for (i, s) in existing.iter().enumerate() {
            if !absorbed.contains(&i) && s.touches(&merged) {
                merged = Span::new(merged.start.min(s.start), merged.end.max(s.end));
                absorbed.push(i);
            }
        }
        if absorbed.len() == before {
            break;
        }
    }
    if absorbed.is_empty() {
        return Decision::Accept;
    }
    // Already covered: nothing to add.
    if let Some(&index) = absorbed.iter().find(|&&i| existing[i] == merged) {
        return Decision::Reject {
            kind: ConflictKind::DuplicateSlot,
            index,
        };
    }
    absorbed.sort_unstable();
    Decision::Merge {
        span: merged,
        absorbed,
    }
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    normalize_range(span.start, span.end)?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(pairs: &[(Ms, Ms)]) -> Vec<Span> {
        pairs.iter().map(|&(s, e)| Span::new(s, e)).collect()
    }

    #[test]
    fn policy_parsing() {
        assert_eq!("strict".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Strict);
        assert_eq!("dedup-only".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::DedupOnly);
        assert_eq!("DEDUP_ONLY".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::DedupOnly);
        assert_eq!("merge".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Merge);
        assert!("lenient".parse::<ConflictPolicy>().is_err());
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::DedupOnly);
        assert_eq!(ConflictPolicy::DedupOnly.to_string(), "dedup_only");
    }

    #[test]
    fn empty_existing_always_accepts() {
        for policy in [ConflictPolicy::Strict, ConflictPolicy::DedupOnly, ConflictPolicy::Merge] {
            assert_eq!(check(&Span::new(0, 10), &[], policy), Decision::Accept);
        }
    }

    #[test]
    fn exact_duplicate_rejected_under_every_policy() {
        let existing = spans(&[(0, 5), (10, 20)]);
        for policy in [ConflictPolicy::Strict, ConflictPolicy::DedupOnly, ConflictPolicy::Merge] {
            assert_eq!(
                check(&Span::new(10, 20), &existing, policy),
                Decision::Reject {
                    kind: ConflictKind::DuplicateSlot,
                    index: 1
                }
            );
        }
    }

    #[test]
    fn dedup_only_accepts_overlap() {
        let existing = spans(&[(10, 20)]);
        assert_eq!(
            check(&Span::new(15, 25), &existing, ConflictPolicy::DedupOnly),
            Decision::Accept
        );
        // Same start, different end is not a duplicate.
        assert_eq!(
            check(&Span::new(10, 30), &existing, ConflictPolicy::DedupOnly),
            Decision::Accept
        );
    }

    #[test]
    fn strict_rejects_overlap_but_not_adjacency() {
        let existing = spans(&[(10, 20), (30, 40)]);
        assert_eq!(
            check(&Span::new(35, 45), &existing, ConflictPolicy::Strict),
            Decision::Reject {
                kind: ConflictKind::OverlappingSlot,
                index: 1
            }
        );
        assert_eq!(
            check(&Span::new(20, 30), &existing, ConflictPolicy::Strict),
            Decision::Accept
        );
    }

    #[test]
    fn merge_coalesces_overlap_and_adjacency() {
        let existing = spans(&[(0, 10), (20, 30), (50, 60)]);
        assert_eq!(
            check(&Span::new(10, 20), &existing, ConflictPolicy::Merge),
            Decision::Merge {
                span: Span::new(0, 30),
                absorbed: vec![0, 1]
            }
        );
        assert_eq!(
            check(&Span::new(55, 70), &existing, ConflictPolicy::Merge),
            Decision::Merge {
                span: Span::new(50, 70),
                absorbed: vec![2]
            }
        );
        assert_eq!(
            check(&Span::new(35, 45), &existing, ConflictPolicy::Merge),
            Decision::Accept
        );
    }

    #[test]
    fn merge_is_transitive() {
        // Candidate only touches (9,20); growing to (9,25) then reaches (0,10).
        let existing = spans(&[(0, 10), (9, 20), (40, 50)]);
        assert_eq!(
            check(&Span::new(18, 25), &existing, ConflictPolicy::Merge),
            Decision::Merge {
                span: Span::new(0, 25),
                absorbed: vec![0, 1]
            }
        );
    }

    #[test]
    fn merge_inside_existing_is_duplicate() {
        let existing = spans(&[(0, 100)]);
        assert_eq!(
            check(&Span::new(20, 30), &existing, ConflictPolicy::Merge),
            Decision::Reject {
                kind: ConflictKind::DuplicateSlot,
                index: 0
            }
        );
    }

    #[test]
    fn validate_span_limits() {
        let ok = Span::new(MIN_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS + 1000);
        assert!(validate_span(&ok).is_ok());
        let early = Span::new(0, 1000);
        assert!(matches!(validate_span(&early), Err(EngineError::LimitExceeded(_))));
        let wide = Span::new(
            MIN_VALID_TIMESTAMP_MS,
            MIN_VALID_TIMESTAMP_MS + MAX_SPAN_DURATION_MS + 1,
        );
        assert!(matches!(validate_span(&wide), Err(EngineError::LimitExceeded(_))));
        let inverted = Span {
            start: MIN_VALID_TIMESTAMP_MS + 10,
            end: MIN_VALID_TIMESTAMP_MS,
        };
        assert!(matches!(validate_span(&inverted), Err(EngineError::Validation(_))));
    }
}
