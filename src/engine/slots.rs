use crate::model::*;

// ── Slot Generator ────────────────────────────────────────────────

/// Build the status-labelled timeline for the given bookable segments.
///
/// Segments are walked independently. Reservations that occupy time at `now`
/// are ordered by `(start, id)`, clipped to the segment, and emitted as BOOKED;
/// the gaps between them are AVAILABLE. Nothing is emitted outside a segment.
pub fn timeline(bookable: &[Span], resource: &ResourceState, now: Ms) -> Vec<Slot> {
    let granularity = resource.slot_granularity_ms.filter(|g| *g > 0);
    let mut slots = Vec::new();

    for segment in bookable {
        let mut active: Vec<&Reservation> = resource
            .overlapping(segment)
            .filter(|r| r.occupies(now))
            .collect();
        active.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));

        let mut cursor = segment.start;
        for r in active {
            let Some(clipped) = r.span.clamp_to(segment) else {
                continue;
            };
            if clipped.start > cursor {
                push_available(&mut slots, cursor, clipped.start, granularity);
            }
            let booked_start = clipped.start.max(cursor);
            if booked_start < clipped.end {
                slots.push(Slot {
                    start: booked_start,
                    end: clipped.end,
                    status: SlotStatus::Booked,
                    booking_ref: Some(SlotBooking {
                        id: r.id,
                        requester_id: r.requester_id.clone(),
                        status: r.status,
                    }),
                });
            }
            cursor = cursor.max(clipped.end);
        }
        if cursor < segment.end {
            push_available(&mut slots, cursor, segment.end, granularity);
        }
    }

    slots
}

fn push_available(slots: &mut Vec<Slot>, start: Ms, end: Ms, granularity: Option<Ms>) {
    let step = granularity.unwrap_or(end - start);
    let mut at = start;
    while at < end {
        let next = (at + step).min(end);
        slots.push(Slot {
            start: at,
            end: next,
            status: SlotStatus::Available,
            booking_ref: None,
        });
        at = next;
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
