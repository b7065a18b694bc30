use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::validation("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::validation("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::validation("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_requester(requester_id: &str) -> Result<(), EngineError> {
    if requester_id.trim().is_empty() {
        return Err(EngineError::validation("requester_id is required"));
    }
    if requester_id.len() > MAX_REQUESTER_ID_LEN {
        return Err(EngineError::validation("requester_id too long"));
    }
    Ok(())
}

pub(crate) fn validate_reason(reason: Option<&str>) -> Result<(), EngineError> {
    if reason.is_some_and(|r| r.len() > MAX_REASON_LEN) {
        return Err(EngineError::validation("reason too long"));
    }
    Ok(())
}

pub(crate) fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::validation("notes too long"));
    }
    Ok(())
}

/// Ids of every reservation that occupies time at `now` and overlaps `span`.
/// Sorted, so the same state always reports the same conflict list.
pub(crate) fn find_conflicts(rs: &ResourceState, span: &Span, now: Ms) -> Vec<Ulid> {
    let mut ids: Vec<Ulid> = rs
        .overlapping(span)
        .filter(|r| r.occupies(now))
        .map(|r| r.id)
        .collect();
    ids.sort();
    ids
}

pub(crate) fn check_no_conflict(rs: &ResourceState, span: &Span, now: Ms) -> Result<(), EngineError> {
    let conflicts = find_conflicts(rs, span, now);
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Conflict(conflicts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Ms = 1_704_067_200_000; // 2024-01-01T00:00:00Z

    fn resource_with(reservations: Vec<Reservation>) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), None, true, None, None);
        for r in reservations {
            rs.insert_reservation(r);
        }
        rs
    }

    fn reservation(start: Ms, end: Ms, status: ReservationStatus, hold_expires_at: Option<Ms>) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id: Ulid::nil(),
            requester_id: "bob".into(),
            span: Span::new(BASE + start, BASE + end),
            status,
            created_at: BASE,
            updated_at: BASE,
            hold_expires_at,
            cancel_cause: None,
            recurring_series_id: None,
            reason: None,
            notes: None,
        }
    }

    #[test]
    fn validate_rejects_inverted_and_empty() {
        assert!(validate_span(&Span { start: BASE + 10, end: BASE }).is_err());
        assert!(validate_span(&Span { start: BASE, end: BASE }).is_err());
        assert!(validate_span(&Span::new(BASE, BASE + 1)).is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range() {
        assert!(validate_span(&Span::new(0, 1000)).is_err());
        assert!(validate_span(&Span::new(BASE, BASE + MAX_SPAN_DURATION_MS + 1)).is_err());
    }

    #[test]
    fn requester_must_be_present() {
        assert!(validate_requester("").is_err());
        assert!(validate_requester("   ").is_err());
        assert!(validate_requester(&"x".repeat(MAX_REQUESTER_ID_LEN + 1)).is_err());
        assert!(validate_requester("user-42").is_ok());
    }

    #[test]
    fn conflict_lists_every_overlap() {
        let a = reservation(100, 200, ReservationStatus::Confirmed, None);
        let b = reservation(200, 300, ReservationStatus::OnHold, Some(BASE + 10_000));
        let mut expected = vec![a.id, b.id];
        expected.sort();
        let rs = resource_with(vec![a, b]);

        let err = check_no_conflict(&rs, &Span::new(BASE + 150, BASE + 250), BASE).unwrap_err();
        match err {
            EngineError::Conflict(ids) => assert_eq!(ids, expected),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn abutment_is_not_a_conflict() {
        let rs = resource_with(vec![reservation(100, 200, ReservationStatus::Confirmed, None)]);
        assert!(check_no_conflict(&rs, &Span::new(BASE + 200, BASE + 300), BASE).is_ok());
        assert!(check_no_conflict(&rs, &Span::new(BASE, BASE + 100), BASE).is_ok());
    }

    #[test]
    fn expired_hold_does_not_block() {
        let rs = resource_with(vec![reservation(100, 200, ReservationStatus::OnHold, Some(BASE))]);
        assert!(check_no_conflict(&rs, &Span::new(BASE + 100, BASE + 200), BASE).is_ok());
        assert!(check_no_conflict(&rs, &Span::new(BASE + 100, BASE + 200), BASE - 1).is_err());
    }

    #[test]
    fn completed_blocks_cancelled_does_not() {
        let rs = resource_with(vec![
            reservation(100, 200, ReservationStatus::Completed, None),
            reservation(300, 400, ReservationStatus::Cancelled, None),
            reservation(500, 600, ReservationStatus::NoShow, None),
        ]);
        assert!(check_no_conflict(&rs, &Span::new(BASE + 150, BASE + 160), BASE).is_err());
        assert!(check_no_conflict(&rs, &Span::new(BASE + 300, BASE + 600), BASE).is_ok());
    }
}
