//! Exact filter evaluation.
//!
//! The storage prefilter over-approximates, so every candidate it returns
//! is confirmed here by recursive descent over the filter tree and the
//! object's component tree. Evaluation is pure: the same object and
//! filter always produce the same verdict.

use chrono_tz::Tz;
use log::warn;

use crate::errors::{QueryError, QueryResult};
use crate::filter::{CalendarFilter, CompFilter, ParamFilter, PropFilter};
use crate::object::{CalComponent, CalObject, CalProp};
use crate::recur;

/// Definitive verdict: does `obj` satisfy the filter?
///
/// A malformed recurrence rule on the candidate is logged and counts as a
/// non-match rather than failing the query; one broken stored object must
/// not take down a whole listing. Filter shapes with no defined semantics
/// are errors, never silent verdicts.
pub fn matches(obj: &CalObject, filter: &CalendarFilter) -> QueryResult<bool> {
    eval_comp(obj, &obj.root, &filter.root, filter.timezone_or_utc())
}

fn eval_comp(
    obj: &CalObject,
    comp: &CalComponent,
    filter: &CompFilter,
    tz: Tz,
) -> QueryResult<bool> {
    if !comp.name.eq_ignore_ascii_case(&filter.name) {
        return Ok(false);
    }

    if let Some(range) = &filter.time_range {
        // A time range only has meaning on the component that carries the
        // object's schedule.
        if !comp.name.eq_ignore_ascii_case(&obj.component_type) {
            return Err(QueryError::UnsupportedFilterShape(format!(
                "time-range on {} component filter",
                filter.name
            )));
        }
        match recur::occurs_within(obj, range, tz) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(QueryError::InvalidRecurrenceRule(e)) => {
                warn!(
                    "treating {} as non-match: {}",
                    obj.uid.as_deref().unwrap_or("<no uid>"),
                    e
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }

    for prop_filter in &filter.prop_filters {
        if !eval_prop(comp, prop_filter, tz)? {
            return Ok(false);
        }
    }

    for child in &filter.comp_filters {
        if child.is_not_defined {
            if comp.subs_named(&child.name).next().is_some() {
                return Ok(false);
            }
            continue;
        }
        let mut any = false;
        for sub in comp.subs_named(&child.name) {
            if eval_comp(obj, sub, child, tz)? {
                any = true;
                break;
            }
        }
        if !any {
            return Ok(false);
        }
    }

    Ok(true)
}

fn eval_prop(comp: &CalComponent, filter: &PropFilter, tz: Tz) -> QueryResult<bool> {
    if filter.is_not_defined {
        return Ok(comp.props_named(&filter.name).next().is_none());
    }

    if filter.text_match.is_some() && filter.time_range.is_some() {
        return Err(QueryError::UnsupportedFilterShape(format!(
            "prop-filter {} with both text-match and time-range",
            filter.name
        )));
    }

    for prop in comp.props_named(&filter.name) {
        if eval_single_prop(prop, filter, tz)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn eval_single_prop(prop: &CalProp, filter: &PropFilter, tz: Tz) -> QueryResult<bool> {
    if let Some(text_match) = &filter.text_match {
        if !text_match.matches(&prop.value) {
            return Ok(false);
        }
    }

    if let Some(range) = &filter.time_range {
        // Matched against the property's own temporal value; a property
        // without one cannot satisfy a time range.
        match prop.temporal_value() {
            Some(value) => {
                let instant = value.resolve(tz);
                if instant < range.start || instant >= range.end {
                    return Ok(false);
                }
            }
            None => return Ok(false),
        }
    }

    for param_filter in &filter.param_filters {
        if !eval_param(prop, param_filter) {
            return Ok(false);
        }
    }

    Ok(true)
}

fn eval_param(prop: &CalProp, filter: &ParamFilter) -> bool {
    let mut values = prop
        .params
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(&filter.name))
        .map(|(_, v)| v.as_str());

    if filter.is_not_defined {
        return values.next().is_none();
    }

    match &filter.text_match {
        Some(text_match) => values.any(|v| text_match.matches(v)),
        None => values.next().is_some(),
    }
}
