//! Read-only calendar object view.
//!
//! Storage hands the engine serialized iCalendar text; [`CalObject::from_ics`]
//! decodes it into the generic component tree the evaluator walks, plus the
//! indexed master fields (UID, summary, start/end, recurrence material) the
//! expander and prefilter need. Nothing here is mutated after construction.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use icalendar::parser;
use log::warn;

use crate::errors::{QueryError, QueryResult};

/// A temporal value as iCalendar knows them: date-only, floating
/// date-time, UTC date-time, or a date-time pinned to a named zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalTime {
    Date(NaiveDate),
    Floating(NaiveDateTime),
    Utc(DateTime<Utc>),
    Zoned { local: NaiveDateTime, tzid: String },
}

impl CalTime {
    /// Date values are always floating: `20240101` cannot be pinned to an
    /// instant without choosing a zone first. Date-times float when they
    /// carry no zone and are not UTC.
    pub fn is_floating(&self) -> bool {
        matches!(self, CalTime::Date(_) | CalTime::Floating(_))
    }

    /// Pin this value to a UTC instant, interpreting floating values in
    /// `fallback` (the query's time zone). An unknown TZID also falls
    /// back, with a warning, rather than failing the whole candidate.
    pub fn resolve(&self, fallback: Tz) -> DateTime<Utc> {
        match self {
            CalTime::Utc(dt) => *dt,
            CalTime::Date(d) => pin_local(d.and_hms_opt(0, 0, 0).unwrap_or_default(), fallback),
            CalTime::Floating(naive) => pin_local(*naive, fallback),
            CalTime::Zoned { local, tzid } => match tzid.parse::<Tz>() {
                Ok(tz) => pin_local(*local, tz),
                Err(_) => {
                    warn!("unknown TZID {}, treating value as floating", tzid);
                    pin_local(*local, fallback)
                }
            },
        }
    }

    /// Parse an iCalendar date or date-time property value, honoring the
    /// `VALUE=DATE` and `TZID` parameters.
    pub fn parse(value: &str, params: &[(String, String)]) -> Option<CalTime> {
        let value = value.trim();
        let tzid = params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("TZID"))
            .map(|(_, v)| v.clone());
        let is_date = params
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("VALUE") && v == "DATE")
            || (value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()));

        if is_date {
            return NaiveDate::parse_from_str(value, "%Y%m%d")
                .ok()
                .map(CalTime::Date);
        }
        if let Some(tzid) = tzid {
            return NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
                .ok()
                .map(|local| CalTime::Zoned { local, tzid });
        }
        if let Some(stripped) = value.strip_suffix('Z') {
            return NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S")
                .ok()
                .map(|naive| CalTime::Utc(naive.and_utc()));
        }
        NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
            .ok()
            .map(CalTime::Floating)
    }
}

/// Resolve a local wall-clock time in `tz` to UTC. Ambiguous times (DST
/// fold) take the earlier instant; nonexistent times (DST gap) shift
/// forward an hour.
fn pin_local(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        chrono::LocalResult::None => tz
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| naive.and_utc()),
    }
}

/// One decoded property: name, value, and its parameters in order.
#[derive(Debug, Clone, PartialEq)]
pub struct CalProp {
    pub name: String,
    pub value: String,
    pub params: Vec<(String, String)>,
}

impl CalProp {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The property's own temporal value, if it has one (DTSTART, DTSTAMP,
    /// COMPLETED, ...). Non-temporal values yield `None`.
    pub fn temporal_value(&self) -> Option<CalTime> {
        CalTime::parse(&self.value, &self.params)
    }
}

/// A decoded iCalendar component: properties plus nested components.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalComponent {
    pub name: String,
    pub props: Vec<CalProp>,
    pub subs: Vec<CalComponent>,
}

impl CalComponent {
    pub fn named(name: impl Into<String>) -> CalComponent {
        CalComponent {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn prop(&self, name: &str) -> Option<&CalProp> {
        self.props.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn props_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a CalProp> {
        self.props
            .iter()
            .filter(move |p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn subs_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a CalComponent> {
        self.subs
            .iter()
            .filter(move |c| c.name.eq_ignore_ascii_case(name))
    }
}

/// An overridden recurrence instance: a component carrying RECURRENCE-ID
/// that replaces the generated occurrence at that instant.
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideInstance {
    pub recurrence_id: CalTime,
    pub start: Option<CalTime>,
    pub end: Option<CalTime>,
    pub comp: CalComponent,
}

/// The engine's view of one stored calendar object: the full parsed
/// VCALENDAR tree plus the indexed fields of its master component.
#[derive(Debug, Clone)]
pub struct CalObject {
    /// The VCALENDAR wrapper with every decoded component under it.
    pub root: CalComponent,
    /// Component name of the master (VEVENT, VTODO, VJOURNAL).
    pub component_type: String,
    pub uid: Option<String>,
    /// Display text, taken from SUMMARY.
    pub summary: Option<String>,
    pub start: Option<CalTime>,
    pub end: Option<CalTime>,
    /// Explicit DURATION, used when no end is present.
    pub duration: Option<chrono::Duration>,
    /// Raw RRULE values, handed to the expander untouched.
    pub rrules: Vec<String>,
    pub rdates: Vec<CalTime>,
    pub exdates: Vec<CalTime>,
    pub overrides: Vec<OverrideInstance>,
}

impl CalObject {
    /// Decode serialized iCalendar text into the engine's view.
    pub fn from_ics(ics: &str) -> QueryResult<CalObject> {
        let unfolded = parser::unfold(ics);
        let calendar = parser::read_calendar(&unfolded)
            .map_err(|e| QueryError::InvalidCalendarData(e.to_string()))?;

        let mut root = CalComponent::named("VCALENDAR");
        root.props = calendar.properties.iter().map(convert_prop).collect();
        root.subs = calendar.components.iter().map(convert_component).collect();

        CalObject::from_tree(root)
    }

    /// Build the view from an already-decoded component tree.
    pub fn from_tree(root: CalComponent) -> QueryResult<CalObject> {
        let master = find_master(&root)?.clone();
        let component_type = master.name.to_ascii_uppercase();

        let overrides = root
            .subs
            .iter()
            .filter(|c| {
                c.name.eq_ignore_ascii_case(&component_type) && c.prop("RECURRENCE-ID").is_some()
            })
            .filter_map(|c| {
                let rid = c.prop("RECURRENCE-ID")?.temporal_value()?;
                Some(OverrideInstance {
                    recurrence_id: rid,
                    start: c.prop("DTSTART").and_then(CalProp::temporal_value),
                    end: end_prop(c).and_then(CalProp::temporal_value),
                    comp: c.clone(),
                })
            })
            .collect();

        let duration = master
            .prop("DURATION")
            .and_then(|p| parse_duration(&p.value));

        Ok(CalObject {
            component_type,
            uid: master.prop("UID").map(|p| p.value.clone()),
            summary: master.prop("SUMMARY").map(|p| p.value.clone()),
            start: master.prop("DTSTART").and_then(CalProp::temporal_value),
            end: end_prop(&master).and_then(CalProp::temporal_value),
            duration,
            rrules: master.props_named("RRULE").map(|p| p.value.clone()).collect(),
            rdates: date_list(&master, "RDATE"),
            exdates: date_list(&master, "EXDATE"),
            overrides,
            root,
        })
    }

    pub fn is_recurring(&self) -> bool {
        !self.rrules.is_empty() || !self.rdates.is_empty()
    }

    pub fn is_floating(&self) -> bool {
        self.start.as_ref().map(CalTime::is_floating).unwrap_or(false)
    }

    /// The master component inside `root`.
    pub fn master(&self) -> Option<&CalComponent> {
        find_master(&self.root).ok()
    }
}

/// The master component: the first non-timezone component without a
/// RECURRENCE-ID, or the sole component if only overrides are stored.
fn find_master(root: &CalComponent) -> QueryResult<&CalComponent> {
    let candidates: Vec<&CalComponent> = root
        .subs
        .iter()
        .filter(|c| !c.name.eq_ignore_ascii_case("VTIMEZONE"))
        .collect();

    candidates
        .iter()
        .find(|c| c.prop("RECURRENCE-ID").is_none())
        .copied()
        .or_else(|| {
            if candidates.len() == 1 {
                Some(candidates[0])
            } else {
                None
            }
        })
        .ok_or_else(|| QueryError::InvalidCalendarData("no component in calendar found".to_string()))
}

/// DTEND for events, DUE for tasks.
fn end_prop(comp: &CalComponent) -> Option<&CalProp> {
    comp.prop("DTEND").or_else(|| comp.prop("DUE"))
}

/// Collect the values of every RDATE/EXDATE property, splitting
/// comma-separated lists and carrying each property's own parameters.
fn date_list(comp: &CalComponent, name: &str) -> Vec<CalTime> {
    comp.props_named(name)
        .flat_map(|p| {
            p.value
                .split(',')
                .filter_map(|v| CalTime::parse(v, &p.params))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn parse_duration(value: &str) -> Option<chrono::Duration> {
    let negative = value.starts_with('-');
    let trimmed = value.trim_start_matches(['-', '+']);
    let parsed = iso8601::duration(trimmed).ok()?;
    let std: std::time::Duration = parsed.into();
    let duration = chrono::Duration::from_std(std).ok()?;
    Some(if negative { -duration } else { duration })
}

fn convert_prop(prop: &parser::Property) -> CalProp {
    CalProp {
        name: prop.name.to_string(),
        value: prop.val.to_string(),
        params: prop
            .params
            .iter()
            .map(|p| {
                (
                    p.key.to_string(),
                    p.val.as_ref().map(|v| v.to_string()).unwrap_or_default(),
                )
            })
            .collect(),
    }
}

fn convert_component(comp: &parser::Component) -> CalComponent {
    CalComponent {
        name: comp.name.to_string(),
        props: comp.properties.iter().map(convert_prop).collect(),
        subs: comp.components.iter().map(convert_component).collect(),
    }
}
