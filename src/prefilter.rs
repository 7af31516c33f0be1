//! First-pass storage narrowing.
//!
//! A filter tree is translated into a flat conjunction the storage layer
//! can index on: component type, UID/display-text patterns, and a coarse
//! time bound. The translation over-approximates; every true match passes
//! the prefilter, and any filter shape that cannot be represented
//! faithfully translates to `None` ("scan everything") instead of a
//! narrower, wrong predicate. "Cannot narrow" is an expected outcome, not
//! an error.

use chrono_tz::Tz;
use log::debug;

use crate::errors::{QueryError, QueryResult};
use crate::filter::{
    CalendarFilter, CompFilter, PropFilter, TextMatch, TimeRange, COMP_VCALENDAR, COMP_VEVENT,
    COMP_VJOURNAL, COMP_VTODO, PROP_DESCRIPTION, PROP_SUMMARY, PROP_UID,
};
use crate::object::{CalObject, CalTime};
use crate::recur::{self, Occurrence};

/// A storage-side `LIKE`/`NOT LIKE` pattern, with case sensitivity taken
/// from the originating text-match's collation.
#[derive(Debug, Clone)]
pub struct TextPattern {
    pub value: String,
    pub caseless: bool,
    pub negate: bool,
}

impl TextPattern {
    fn from_text_match(text_match: &TextMatch) -> TextPattern {
        TextPattern {
            value: text_match.value.clone(),
            caseless: text_match.collation.is_caseless(),
            negate: text_match.negate,
        }
    }

    /// Substring semantics of the storage pattern (`%value%`).
    pub fn matches(&self, target: &str) -> bool {
        let hit = if self.caseless {
            target
                .to_ascii_lowercase()
                .contains(&self.value.to_ascii_lowercase())
        } else {
            target.contains(&self.value)
        };
        hit != self.negate
    }
}

/// The flat storage predicate: everything here is a conjunction.
#[derive(Debug, Clone, Default)]
pub struct ItemPrefilter {
    /// Component-type membership (VEVENT, VTODO, VJOURNAL).
    pub component_types: Vec<String>,
    pub uid: Option<TextPattern>,
    pub display_name: Option<TextPattern>,
    /// Coarse bound against the object's indexed occurrence range.
    pub period: Option<TimeRange>,
    pub timezone: Option<Tz>,
}

impl ItemPrefilter {
    /// The predicate's semantics, as the storage layer would apply them
    /// against its indexed columns. Used directly by in-memory backends
    /// and by the soundness tests.
    pub fn accepts(&self, obj: &CalObject) -> bool {
        if !self.component_types.is_empty()
            && !self
                .component_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&obj.component_type))
        {
            return false;
        }

        if let Some(pattern) = &self.uid {
            match &obj.uid {
                Some(uid) => {
                    if !pattern.matches(uid) {
                        return false;
                    }
                }
                None => {
                    if !pattern.negate {
                        return false;
                    }
                }
            }
        }

        if let Some(pattern) = &self.display_name {
            match &obj.summary {
                Some(summary) => {
                    if !pattern.matches(summary) {
                        return false;
                    }
                }
                None => {
                    if !pattern.negate {
                        return false;
                    }
                }
            }
        }

        if let Some(period) = &self.period {
            // Floating objects cannot be pinned at index time, so they
            // always pass the coarse bound; the evaluator decides.
            if obj.start.as_ref().map(CalTime::is_floating).unwrap_or(true) {
                return true;
            }
            let tz = self.timezone.unwrap_or(chrono_tz::UTC);
            match recur::occurrence_bounds(obj, tz) {
                Ok((earliest, Some(latest))) => {
                    let bounds = Occurrence {
                        start: earliest,
                        end: latest,
                    };
                    if !bounds.intersects(period) {
                        return false;
                    }
                }
                // Unbounded recurrences reach any future range; only a
                // period entirely before the first occurrence can be
                // excluded.
                Ok((earliest, None)) => {
                    if period.end <= earliest {
                        return false;
                    }
                }
                // Never exclude what we cannot bound.
                Err(_) => return true,
            }
        }

        true
    }
}

/// Translate a filter tree into a first-pass storage predicate.
///
/// `Ok(None)` means the tree's shape cannot be represented soundly; the
/// caller scans the whole collection and relies on the evaluator alone.
/// Property filters the original server rejects outright (UID/SUMMARY
/// without a text match, unrecognized names) are hard errors.
pub fn translate(filter: &CalendarFilter) -> QueryResult<Option<ItemPrefilter>> {
    let root = &filter.root;
    if !root.name.eq_ignore_ascii_case(COMP_VCALENDAR) {
        return Err(QueryError::UnsupportedComponent(root.name.clone()));
    }

    // Only the single top-level container plus one child component filter
    // translate; everything else falls back to a full scan.
    if root.comp_filters.len() != 1 {
        debug!("prefilter fallback: {} sibling comp-filters", root.comp_filters.len());
        return Ok(None);
    }

    let comp = &root.comp_filters[0];
    if comp.is_not_defined {
        return Ok(None);
    }
    if !is_indexed_component(&comp.name) {
        return Ok(None);
    }
    if !comp.comp_filters.is_empty() {
        debug!("prefilter fallback: nested sub-component filter");
        return Ok(None);
    }
    if has_param_filters(comp) {
        debug!("prefilter fallback: param filter present");
        return Ok(None);
    }
    if comp.prop_filters.iter().any(|p| p.is_not_defined) {
        return Ok(None);
    }

    let mut prefilter = ItemPrefilter {
        component_types: vec![comp.name.to_ascii_uppercase()],
        timezone: filter.timezone,
        ..Default::default()
    };

    if let Some(range) = &comp.time_range {
        prefilter.period = Some(*range);
    }

    for prop_filter in &comp.prop_filters {
        translate_prop_filter(prop_filter, &mut prefilter)?;
    }

    Ok(Some(prefilter))
}

fn translate_prop_filter(
    prop_filter: &PropFilter,
    prefilter: &mut ItemPrefilter,
) -> QueryResult<()> {
    let name = prop_filter.name.as_str();
    if name.eq_ignore_ascii_case(PROP_UID) {
        prefilter.uid = Some(required_pattern(prop_filter)?);
    } else if name.eq_ignore_ascii_case(PROP_SUMMARY) {
        prefilter.display_name = Some(required_pattern(prop_filter)?);
    } else if name.eq_ignore_ascii_case(PROP_DESCRIPTION) {
        // Validated but adds no storage predicate; the evaluator checks
        // the actual description text.
        required_pattern(prop_filter)?;
    } else {
        return Err(QueryError::UnsupportedPropertyFilter(
            prop_filter.name.clone(),
        ));
    }
    Ok(())
}

fn required_pattern(prop_filter: &PropFilter) -> QueryResult<TextPattern> {
    match &prop_filter.text_match {
        Some(text_match) => Ok(TextPattern::from_text_match(text_match)),
        None => Err(QueryError::UnsupportedPropertyFilter(format!(
            "{}: must contain text match filter",
            prop_filter.name
        ))),
    }
}

fn is_indexed_component(name: &str) -> bool {
    name.eq_ignore_ascii_case(COMP_VEVENT)
        || name.eq_ignore_ascii_case(COMP_VTODO)
        || name.eq_ignore_ascii_case(COMP_VJOURNAL)
}

fn has_param_filters(comp: &CompFilter) -> bool {
    comp.prop_filters.iter().any(|p| !p.param_filters.is_empty())
        || comp.comp_filters.iter().any(has_param_filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{ParamFilter, TextMatch};
    use chrono::{TimeZone, Utc};

    fn filter_with(comp: CompFilter) -> CalendarFilter {
        let mut root = CompFilter::named("VCALENDAR");
        root.comp_filters.push(comp);
        CalendarFilter::new(root, None).unwrap()
    }

    fn summary_filter(value: &str) -> PropFilter {
        let mut pf = PropFilter::named("SUMMARY");
        pf.text_match = Some(TextMatch::new(value));
        pf
    }

    #[test]
    fn vevent_time_range_translates() {
        let mut vevent = CompFilter::named("VEVENT");
        vevent.time_range = Some(
            TimeRange::new(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            )
            .unwrap(),
        );
        let prefilter = translate(&filter_with(vevent)).unwrap().unwrap();
        assert_eq!(prefilter.component_types, vec!["VEVENT".to_string()]);
        assert!(prefilter.period.is_some());
    }

    #[test]
    fn summary_maps_to_display_name_pattern() {
        let mut vevent = CompFilter::named("VEVENT");
        vevent.prop_filters.push(summary_filter("meeting"));
        let prefilter = translate(&filter_with(vevent)).unwrap().unwrap();
        let pattern = prefilter.display_name.unwrap();
        assert!(pattern.caseless);
        assert!(!pattern.negate);
        assert!(pattern.matches("Team Meeting"));
    }

    #[test]
    fn multiple_sibling_comp_filters_fall_back() {
        let mut root = CompFilter::named("VCALENDAR");
        root.comp_filters.push(CompFilter::named("VEVENT"));
        root.comp_filters.push(CompFilter::named("VTODO"));
        let filter = CalendarFilter::new(root, None).unwrap();
        assert!(translate(&filter).unwrap().is_none());
    }

    #[test]
    fn nested_subcomponent_falls_back() {
        let mut vevent = CompFilter::named("VEVENT");
        vevent.comp_filters.push(CompFilter::named("VALARM"));
        assert!(translate(&filter_with(vevent)).unwrap().is_none());
    }

    #[test]
    fn param_filter_falls_back() {
        let mut vevent = CompFilter::named("VEVENT");
        let mut pf = PropFilter::named("ATTENDEE");
        pf.param_filters.push(ParamFilter {
            name: "PARTSTAT".to_string(),
            is_not_defined: false,
            text_match: None,
        });
        vevent.prop_filters.push(pf);
        assert!(translate(&filter_with(vevent)).unwrap().is_none());
    }

    #[test]
    fn uid_without_text_match_is_rejected() {
        let mut vevent = CompFilter::named("VEVENT");
        vevent.prop_filters.push(PropFilter::named("UID"));
        let err = translate(&filter_with(vevent)).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedPropertyFilter(_)));
    }

    #[test]
    fn unknown_property_is_rejected() {
        let mut vevent = CompFilter::named("VEVENT");
        vevent.prop_filters.push(summary_filter("x"));
        vevent.prop_filters.push(PropFilter::named("LOCATION"));
        let err = translate(&filter_with(vevent)).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedPropertyFilter(_)));
    }

    #[test]
    fn description_adds_no_predicate() {
        let mut vevent = CompFilter::named("VEVENT");
        let mut pf = PropFilter::named("DESCRIPTION");
        pf.text_match = Some(TextMatch::new("notes"));
        vevent.prop_filters.push(pf);
        let prefilter = translate(&filter_with(vevent)).unwrap().unwrap();
        assert!(prefilter.uid.is_none());
        assert!(prefilter.display_name.is_none());
    }

    #[test]
    fn accepts_is_sound_for_matching_event() {
        use crate::eval;
        use crate::object::CalObject;

        let ics = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:T\r\n\
BEGIN:VEVENT\r\nUID:x@y\r\nDTSTART:20240115T100000Z\r\nDTEND:20240115T110000Z\r\n\
SUMMARY:Team Meeting\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let obj = CalObject::from_ics(ics).unwrap();

        let mut vevent = CompFilter::named("VEVENT");
        vevent.time_range = Some(
            TimeRange::new(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            )
            .unwrap(),
        );
        vevent.prop_filters.push(summary_filter("meeting"));
        let filter = filter_with(vevent);

        assert!(eval::matches(&obj, &filter).unwrap());
        let prefilter = translate(&filter).unwrap().unwrap();
        assert!(prefilter.accepts(&obj));
    }
}
