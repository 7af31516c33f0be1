//! The calendar-query filter model.
//!
//! A parsed CALDAV:filter is an immutable tree: component filters nesting
//! property filters, which nest parameter filters, with text-match and
//! time-range leaves. The tree is built once per request, either directly
//! from the structs below or from the neutral `xmltree::Element`
//! representation the protocol layer produces, and is never mutated
//! afterwards.

use chrono::{DateTime, Months, NaiveDateTime, Utc};
use chrono_tz::Tz;
use xmltree::{Element, XMLNode};

use crate::errors::{QueryError, QueryResult};

pub(crate) const COMP_VCALENDAR: &str = "VCALENDAR";
pub(crate) const COMP_VEVENT: &str = "VEVENT";
pub(crate) const COMP_VTODO: &str = "VTODO";
pub(crate) const COMP_VJOURNAL: &str = "VJOURNAL";
pub(crate) const PROP_UID: &str = "UID";
pub(crate) const PROP_SUMMARY: &str = "SUMMARY";
pub(crate) const PROP_DESCRIPTION: &str = "DESCRIPTION";

/// Text-comparison rule for a text-match leaf. The protocol defines a
/// closed set, so this is an enum rather than a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Collation {
    /// `i;ascii-casemap`, the default: case is ignored when matching.
    #[default]
    AsciiCasemap,
    /// `i;octet`: exact byte comparison.
    Octet,
}

impl Collation {
    /// Look up a collation by its protocol identifier. `None` selects the
    /// default. Unknown identifiers are rejected here, at construction
    /// time, never during evaluation.
    pub fn from_identifier(id: Option<&str>) -> QueryResult<Collation> {
        match id {
            None | Some("i;ascii-casemap") => Ok(Collation::AsciiCasemap),
            Some("i;octet") => Ok(Collation::Octet),
            Some(other) => Err(QueryError::UnsupportedCollation(other.to_string())),
        }
    }

    pub fn is_caseless(&self) -> bool {
        *self == Collation::AsciiCasemap
    }
}

/// The CALDAV:text-match leaf: a substring test with collation and
/// optional negation.
#[derive(Debug, Clone)]
pub struct TextMatch {
    pub value: String,
    pub collation: Collation,
    pub negate: bool,
}

impl TextMatch {
    pub fn new(value: impl Into<String>) -> TextMatch {
        TextMatch {
            value: value.into(),
            collation: Collation::default(),
            negate: false,
        }
    }

    /// Substring containment under this leaf's collation, inverted when
    /// `negate` is set.
    pub fn matches(&self, target: &str) -> bool {
        let hit = if self.collation.is_caseless() {
            target
                .to_ascii_lowercase()
                .contains(&self.value.to_ascii_lowercase())
        } else {
            target.contains(&self.value)
        };
        hit != self.negate
    }

    fn from_element(elem: &Element) -> QueryResult<TextMatch> {
        let value = elem
            .children
            .iter()
            .find_map(|child| match child {
                XMLNode::Text(text) => Some(text.trim().to_string()),
                _ => None,
            })
            .unwrap_or_default();

        Ok(TextMatch {
            value,
            collation: Collation::from_identifier(
                elem.attributes.get("collation").map(|s| s.as_str()),
            )?,
            negate: elem
                .attributes
                .get("negate-condition")
                .map(|v| v == "yes")
                .unwrap_or(false),
        })
    }
}

/// The CALDAV:time-range leaf. Both bounds are UTC instants; the range is
/// half-open, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> QueryResult<TimeRange> {
        if end < start {
            return Err(QueryError::MalformedTimeRange(format!(
                "end {} before start {}",
                end, start
            )));
        }
        Ok(TimeRange { start, end })
    }

    /// Build from a `time-range` element. `start` is mandatory and must be
    /// a UTC date-time; a missing `end` defaults to start plus one year
    /// (kept for iOS 7 clients that omit it).
    pub fn from_element(elem: &Element) -> QueryResult<TimeRange> {
        let start = match elem.attributes.get("start") {
            Some(s) => parse_utc(s)?,
            None => {
                return Err(QueryError::MalformedTimeRange(
                    "time-range requires a start time".to_string(),
                ));
            }
        };
        let end = match elem.attributes.get("end") {
            Some(s) => parse_utc(s)?,
            None => start
                .checked_add_months(Months::new(12))
                .ok_or_else(|| QueryError::MalformedTimeRange("start out of range".to_string()))?,
        };
        TimeRange::new(start, end)
    }
}

/// Parse an iCalendar "date with UTC time" (`20240101T000000Z`).
pub(crate) fn parse_utc(value: &str) -> QueryResult<DateTime<Utc>> {
    let trimmed = match value.strip_suffix('Z') {
        Some(t) => t,
        None => {
            return Err(QueryError::MalformedTimeRange(format!(
                "time-range value must be UTC: {}",
                value
            )));
        }
    };
    NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| QueryError::MalformedTimeRange(format!("{}: {}", value, e)))
}

/// CALDAV:param-filter.
#[derive(Debug, Clone)]
pub struct ParamFilter {
    pub name: String,
    pub is_not_defined: bool,
    pub text_match: Option<TextMatch>,
}

/// CALDAV:prop-filter.
#[derive(Debug, Clone)]
pub struct PropFilter {
    pub name: String,
    pub is_not_defined: bool,
    pub text_match: Option<TextMatch>,
    pub time_range: Option<TimeRange>,
    pub param_filters: Vec<ParamFilter>,
}

impl PropFilter {
    pub fn named(name: impl Into<String>) -> PropFilter {
        PropFilter {
            name: name.into(),
            is_not_defined: false,
            text_match: None,
            time_range: None,
            param_filters: Vec::new(),
        }
    }
}

/// CALDAV:comp-filter.
#[derive(Debug, Clone)]
pub struct CompFilter {
    pub name: String,
    pub is_not_defined: bool,
    pub time_range: Option<TimeRange>,
    pub prop_filters: Vec<PropFilter>,
    pub comp_filters: Vec<CompFilter>,
}

impl CompFilter {
    pub fn named(name: impl Into<String>) -> CompFilter {
        CompFilter {
            name: name.into(),
            is_not_defined: false,
            time_range: None,
            prop_filters: Vec::new(),
            comp_filters: Vec::new(),
        }
    }
}

/// A complete parsed calendar-query filter: the VCALENDAR root filter plus
/// the time zone the query supplied for interpreting floating times.
#[derive(Debug, Clone)]
pub struct CalendarFilter {
    pub root: CompFilter,
    pub timezone: Option<Tz>,
}

impl CalendarFilter {
    /// Wrap a root component filter. The root must name the top-level
    /// iCalendar container.
    pub fn new(root: CompFilter, timezone: Option<Tz>) -> QueryResult<CalendarFilter> {
        if !root.name.eq_ignore_ascii_case(COMP_VCALENDAR) {
            return Err(QueryError::UnsupportedComponent(root.name.clone()));
        }
        Ok(CalendarFilter { root, timezone })
    }

    /// Build a filter from the neutral element tree the protocol layer
    /// parsed out of the REPORT body. Accepts either the `CALDAV:filter`
    /// wrapper element or the root `comp-filter` itself.
    pub fn from_element(elem: &Element, timezone: Option<Tz>) -> QueryResult<CalendarFilter> {
        let root_elem = if elem.name == "comp-filter" {
            elem
        } else {
            child_elements(elem)
                .find(|e| e.name == "comp-filter")
                .ok_or_else(|| {
                    QueryError::UnsupportedFilterShape(
                        "filter element without a comp-filter".to_string(),
                    )
                })?
        };
        CalendarFilter::new(parse_comp_filter(root_elem)?, timezone)
    }

    /// The time zone used to pin floating times, defaulting to UTC.
    pub fn timezone_or_utc(&self) -> Tz {
        self.timezone.unwrap_or(chrono_tz::UTC)
    }
}

pub(crate) fn child_elements(elem: &Element) -> impl Iterator<Item = &Element> {
    elem.children.iter().filter_map(|child| match child {
        XMLNode::Element(e) => Some(e),
        _ => None,
    })
}

fn filter_name(elem: &Element) -> QueryResult<String> {
    elem.attributes.get("name").cloned().ok_or_else(|| {
        QueryError::UnsupportedFilterShape(format!("{} element without a name", elem.name))
    })
}

fn parse_comp_filter(elem: &Element) -> QueryResult<CompFilter> {
    let mut filter = CompFilter::named(filter_name(elem)?);

    for child in child_elements(elem) {
        match child.name.as_str() {
            "is-not-defined" => filter.is_not_defined = true,
            "time-range" => filter.time_range = Some(TimeRange::from_element(child)?),
            "prop-filter" => filter.prop_filters.push(parse_prop_filter(child)?),
            "comp-filter" => filter.comp_filters.push(parse_comp_filter(child)?),
            _ => {}
        }
    }

    Ok(filter)
}

fn parse_prop_filter(elem: &Element) -> QueryResult<PropFilter> {
    let mut filter = PropFilter::named(filter_name(elem)?);

    for child in child_elements(elem) {
        match child.name.as_str() {
            "is-not-defined" => filter.is_not_defined = true,
            "time-range" => filter.time_range = Some(TimeRange::from_element(child)?),
            "text-match" => filter.text_match = Some(TextMatch::from_element(child)?),
            "param-filter" => filter.param_filters.push(parse_param_filter(child)?),
            _ => {}
        }
    }

    // The filter grammar makes these alternatives, not companions.
    if filter.text_match.is_some() && filter.time_range.is_some() {
        return Err(QueryError::UnsupportedFilterShape(format!(
            "prop-filter {} with both text-match and time-range",
            filter.name
        )));
    }

    Ok(filter)
}

fn parse_param_filter(elem: &Element) -> QueryResult<ParamFilter> {
    let mut filter = ParamFilter {
        name: filter_name(elem)?,
        is_not_defined: false,
        text_match: None,
    };

    for child in child_elements(elem) {
        match child.name.as_str() {
            "is-not-defined" => filter.is_not_defined = true,
            "text-match" => filter.text_match = Some(TextMatch::from_element(child)?),
            _ => {}
        }
    }

    Ok(filter)
}
