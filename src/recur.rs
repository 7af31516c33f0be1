//! Recurrence expansion.
//!
//! Time-range evaluation needs concrete occurrence intervals, so this
//! module feeds an object's DTSTART/RRULE/RDATE/EXDATE material to the
//! `rrule` crate and intersects the generated set with the query range.
//! Occurrences are derived per query and discarded; nothing is cached.
//!
//! RFC 5545 puts no bound on a recurrence rule, so expansion runs under
//! an instance cap. The cap is a deployment policy choice, not a
//! protocol value.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use log::warn;
use rrule::RRuleSet;

use crate::errors::{QueryError, QueryResult};
use crate::filter::TimeRange;
use crate::object::{CalObject, CalTime};

/// One concrete `[start, end)` interval generated by expansion. A
/// point-in-time occurrence has `end == start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Occurrence {
    /// Half-open interval overlap; degenerates to a containment test for
    /// point-in-time occurrences.
    pub fn intersects(&self, range: &TimeRange) -> bool {
        if self.end == self.start {
            self.start >= range.start && self.start < range.end
        } else {
            self.start < range.end && self.end > range.start
        }
    }
}

/// Cap on generated instances per expansion. A rule that still produces
/// instances past this is pathological input, not a real calendar.
const MAX_INSTANCES: u16 = 10_000;

/// True if any occurrence of `obj` intersects the range. Floating times
/// are interpreted in `tz`, the query's zone.
pub fn occurs_within(obj: &CalObject, range: &TimeRange, tz: Tz) -> QueryResult<bool> {
    Ok(!occurrences_within(obj, range, tz)?.is_empty())
}

/// All occurrences of `obj` intersecting the range, in start order.
/// Override instances replace the generated occurrence at their
/// RECURRENCE-ID and contribute their own interval instead.
pub fn occurrences_within(
    obj: &CalObject,
    range: &TimeRange,
    tz: Tz,
) -> QueryResult<Vec<Occurrence>> {
    let start = match &obj.start {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };
    let duration = base_duration(obj, tz);

    if !obj.is_recurring() {
        let s = start.resolve(tz);
        let occ = Occurrence {
            start: s,
            end: effective_end(obj, s, tz),
        };
        return Ok(if occ.intersects(range) { vec![occ] } else { Vec::new() });
    }

    let set = build_rrule_set(obj, tz)?;
    // Occurrences starting before the range can still overlap it, so the
    // window is widened by the occurrence duration before the exact test.
    // after/before are exclusive bounds, hence the one-second padding.
    let rtz: rrule::Tz = Utc.into();
    let result = set
        .after((range.start - duration - Duration::seconds(1)).with_timezone(&rtz))
        .before((range.end + Duration::seconds(1)).with_timezone(&rtz))
        .all(MAX_INSTANCES);
    if result.limited {
        warn!(
            "recurrence expansion for {} hit the {} instance cap",
            obj.uid.as_deref().unwrap_or("<no uid>"),
            MAX_INSTANCES
        );
    }

    let mut starts: Vec<DateTime<Utc>> = result
        .dates
        .into_iter()
        .map(|d| d.with_timezone(&Utc))
        .collect();

    // An override consumes the slot it names and stands in with its own
    // times.
    for ov in &obj.overrides {
        let rid = ov.recurrence_id.resolve(tz);
        starts.retain(|s| *s != rid);
    }

    let mut occurrences: Vec<Occurrence> = starts
        .into_iter()
        .map(|s| Occurrence {
            start: s,
            end: s + duration,
        })
        .collect();

    for ov in &obj.overrides {
        if let Some(os) = &ov.start {
            let s = os.resolve(tz);
            let e = ov
                .end
                .as_ref()
                .map(|e| e.resolve(tz))
                .unwrap_or(s + duration);
            occurrences.push(Occurrence { start: s, end: e });
        }
    }

    occurrences.retain(|o| o.intersects(range));
    occurrences.sort_by_key(|o| o.start);
    Ok(occurrences)
}

/// The earliest occurrence start and latest occurrence end of `obj`,
/// override instances included. `None` for the latest means no finite
/// bound is known: the recurrence is unbounded (no COUNT or UNTIL on
/// some rule), or the expansion hit the instance cap.
pub fn occurrence_bounds(
    obj: &CalObject,
    tz: Tz,
) -> QueryResult<(DateTime<Utc>, Option<DateTime<Utc>>)> {
    let start = obj
        .start
        .as_ref()
        .ok_or_else(|| QueryError::InvalidCalendarData("object without a start".to_string()))?;
    let s = start.resolve(tz);

    if !obj.is_recurring() {
        return Ok((s, Some(effective_end(obj, s, tz))));
    }

    let duration = base_duration(obj, tz);
    let set = build_rrule_set(obj, tz)?;

    let unbounded = obj.rrules.iter().any(|r| {
        let upper = r.to_ascii_uppercase();
        !upper.contains("COUNT=") && !upper.contains("UNTIL=")
    });
    if unbounded {
        let mut earliest = set
            .all(1)
            .dates
            .first()
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(s)
            .min(s);
        for ov in &obj.overrides {
            if let Some(os) = &ov.start {
                earliest = earliest.min(os.resolve(tz));
            }
        }
        return Ok((earliest, None));
    }

    let result = set.all(MAX_INSTANCES);
    if result.limited {
        warn!(
            "occurrence bounds for {} hit the {} instance cap",
            obj.uid.as_deref().unwrap_or("<no uid>"),
            MAX_INSTANCES
        );
    }
    let dates: Vec<DateTime<Utc>> = result
        .dates
        .into_iter()
        .map(|d| d.with_timezone(&Utc))
        .collect();

    let mut earliest = dates.iter().min().copied().unwrap_or(s).min(s);
    let mut latest = dates.iter().max().copied().unwrap_or(s) + duration;
    // Moved instances can sit outside the span the rule generates.
    for ov in &obj.overrides {
        if let Some(os) = &ov.start {
            let ov_start = os.resolve(tz);
            let ov_end = ov
                .end
                .as_ref()
                .map(|e| e.resolve(tz))
                .unwrap_or(ov_start + duration);
            earliest = earliest.min(ov_start);
            latest = latest.max(ov_end);
        }
    }

    // A truncated expansion has no trustworthy upper bound.
    if result.limited {
        return Ok((earliest, None));
    }
    Ok((earliest, Some(latest)))
}

/// The master interval length: DTEND/DUE minus DTSTART, else the explicit
/// DURATION, else zero (point in time).
fn base_duration(obj: &CalObject, tz: Tz) -> Duration {
    if let (Some(start), Some(end)) = (&obj.start, &obj.end) {
        let d = end.resolve(tz) - start.resolve(tz);
        return d.max(Duration::zero());
    }
    obj.duration.unwrap_or_else(Duration::zero).max(Duration::zero())
}

fn effective_end(obj: &CalObject, start: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    match &obj.end {
        Some(end) => end.resolve(tz).max(start),
        None => start + obj.duration.unwrap_or_else(Duration::zero).max(Duration::zero()),
    }
}

/// Reassemble the recurrence material as iCalendar property lines and let
/// the `rrule` crate parse them. Exception and recurrence dates are
/// normalized to UTC instants; the DTSTART keeps its zone so weekly and
/// daily steps follow local wall-clock time across DST.
fn build_rrule_set(obj: &CalObject, tz: Tz) -> QueryResult<RRuleSet> {
    let start = obj.start.as_ref().ok_or_else(|| {
        QueryError::InvalidRecurrenceRule("recurring object without DTSTART".to_string())
    })?;

    let mut lines = vec![dtstart_line(start, tz)];
    for rule in &obj.rrules {
        lines.push(format!("RRULE:{}", rule));
    }
    for rdate in &obj.rdates {
        lines.push(format!("RDATE:{}", utc_value(rdate, tz)));
    }
    for exdate in &obj.exdates {
        lines.push(format!("EXDATE:{}", utc_value(exdate, tz)));
    }

    lines
        .join("\n")
        .parse::<RRuleSet>()
        .map_err(|e| QueryError::InvalidRecurrenceRule(e.to_string()))
}

fn dtstart_line(start: &CalTime, tz: Tz) -> String {
    match start {
        CalTime::Utc(dt) => format!("DTSTART:{}Z", dt.format("%Y%m%dT%H%M%S")),
        CalTime::Zoned { local, tzid } if tzid.parse::<Tz>().is_ok() => {
            format!("DTSTART;TZID={}:{}", tzid, local.format("%Y%m%dT%H%M%S"))
        }
        // Floating and date-only starts expand on the query zone's clock;
        // an unknown TZID is treated the same way.
        other => {
            let utc = other.resolve(tz);
            let local = utc.with_timezone(&tz).naive_local();
            format!("DTSTART;TZID={}:{}", tz.name(), local.format("%Y%m%dT%H%M%S"))
        }
    }
}

fn utc_value(time: &CalTime, tz: Tz) -> String {
    format!("{}Z", time.resolve(tz).format("%Y%m%dT%H%M%S"))
}
