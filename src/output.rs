//! Output projection.
//!
//! A calendar-query can ask for a reduced view of each matching object:
//! only certain components and properties, recurrences expanded into
//! concrete instances inside a window, or the stored recurrence set
//! limited to overrides inside a window. The projection spec is built
//! once from the CALDAV:calendar-data element (or programmatically) and
//! applied per matching object.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use xmltree::Element;

use crate::errors::{QueryError, QueryResult};
use crate::filter::{child_elements, parse_utc, TimeRange};
use crate::object::{CalComponent, CalObject, CalProp};
use crate::recur;

const ICALENDAR_MEDIA_TYPE: &str = "text/calendar";
const ICALENDAR_VERSION: &str = "2.0";

/// One requested property; `no_value` keeps the property but suppresses
/// its value.
#[derive(Debug, Clone)]
pub struct PropertySpec {
    pub name: String,
    pub no_value: bool,
}

/// Projection spec for one component level.
///
/// An axis left unspecified (neither "all" nor an explicit list) keeps
/// everything, so an empty spec is the identity projection. Mixing "all"
/// with an explicit enumeration on the same axis is rejected when the
/// spec is built, as is combining an expand window with a limit window.
#[derive(Debug, Clone)]
pub struct OutputFilter {
    comp_name: String,
    all_sub_components: bool,
    sub_components: Vec<OutputFilter>,
    all_properties: bool,
    properties: Vec<PropertySpec>,
    expand: Option<TimeRange>,
    limit: Option<TimeRange>,
}

impl OutputFilter {
    pub fn new(comp_name: impl Into<String>) -> OutputFilter {
        OutputFilter {
            comp_name: comp_name.into(),
            all_sub_components: false,
            sub_components: Vec::new(),
            all_properties: false,
            properties: Vec::new(),
            expand: None,
            limit: None,
        }
    }

    pub fn comp_name(&self) -> &str {
        &self.comp_name
    }

    pub fn set_all_sub_components(&mut self) -> QueryResult<()> {
        if !self.sub_components.is_empty() {
            return Err(QueryError::UnsupportedFilterShape(
                "allcomp combined with explicit comp".to_string(),
            ));
        }
        self.all_sub_components = true;
        Ok(())
    }

    pub fn add_sub_component(&mut self, sub: OutputFilter) -> QueryResult<()> {
        if self.all_sub_components {
            return Err(QueryError::UnsupportedFilterShape(
                "allcomp combined with explicit comp".to_string(),
            ));
        }
        self.sub_components.push(sub);
        Ok(())
    }

    pub fn set_all_properties(&mut self) -> QueryResult<()> {
        if !self.properties.is_empty() {
            return Err(QueryError::UnsupportedFilterShape(
                "allprop combined with explicit prop".to_string(),
            ));
        }
        self.all_properties = true;
        Ok(())
    }

    pub fn add_property(&mut self, name: impl Into<String>, no_value: bool) -> QueryResult<()> {
        if self.all_properties {
            return Err(QueryError::UnsupportedFilterShape(
                "allprop combined with explicit prop".to_string(),
            ));
        }
        self.properties.push(PropertySpec {
            name: name.into(),
            no_value,
        });
        Ok(())
    }

    pub fn set_expand(&mut self, window: TimeRange) -> QueryResult<()> {
        if self.limit.is_some() {
            return Err(QueryError::ConflictingProjectionOptions);
        }
        self.expand = Some(window);
        Ok(())
    }

    pub fn set_limit(&mut self, window: TimeRange) -> QueryResult<()> {
        if self.expand.is_some() {
            return Err(QueryError::ConflictingProjectionOptions);
        }
        self.limit = Some(window);
        Ok(())
    }

    /// Build a projection spec from a `CALDAV:calendar-data` element.
    /// `Ok(None)` means the element requested no reduction at all.
    pub fn from_element(cdata: &Element) -> QueryResult<Option<OutputFilter>> {
        if let Some(content_type) = cdata.attributes.get("content-type") {
            if content_type != ICALENDAR_MEDIA_TYPE {
                return Err(QueryError::UnsupportedCalendarData(content_type.clone()));
            }
        }
        if let Some(version) = cdata.attributes.get("version") {
            if version != ICALENDAR_VERSION {
                return Err(QueryError::UnsupportedCalendarData(version.clone()));
            }
        }

        let mut result: Option<OutputFilter> = None;
        let mut expand = None;
        let mut limit = None;

        for child in child_elements(cdata) {
            match child.name.as_str() {
                "comp" => {
                    // VCALENDAR is the only top-level component iCalendar
                    // allows, so only one <comp> makes sense here.
                    if result.is_some() {
                        return Err(QueryError::UnsupportedFilterShape(
                            "only one top-level component supported".to_string(),
                        ));
                    }
                    let name = comp_name_attr(child)?;
                    if !name.eq_ignore_ascii_case("VCALENDAR") {
                        return Err(QueryError::UnsupportedComponent(name));
                    }
                    result = Some(parse_comp(child)?);
                }
                "expand" => expand = Some(parse_period(child)?),
                "limit-recurrence-set" => limit = Some(parse_period(child)?),
                _ => {}
            }
        }

        if result.is_none() && (expand.is_some() || limit.is_some()) {
            let mut filter = OutputFilter::new("VCALENDAR");
            filter.set_all_sub_components()?;
            filter.set_all_properties()?;
            result = Some(filter);
        }

        if let Some(filter) = &mut result {
            if let Some(window) = expand {
                filter.set_expand(window)?;
            }
            if let Some(window) = limit {
                filter.set_limit(window)?;
            }
        }

        Ok(result)
    }

    /// Produce the reduced VCALENDAR for one matching object. Floating
    /// and date-only values are resolved in `tz`, the query's zone, when
    /// a window has to be applied.
    pub fn apply(&self, obj: &CalObject, tz: Tz) -> QueryResult<CalComponent> {
        if !self.comp_name.eq_ignore_ascii_case("VCALENDAR") {
            return Err(QueryError::UnsupportedComponent(self.comp_name.clone()));
        }

        let mut reduced = CalComponent::named(obj.root.name.clone());
        reduced.props = self.project_props(&obj.root);

        if let Some(window) = &self.expand {
            reduced.subs = self.expand_instances(obj, window, tz)?;
        } else if let Some(window) = &self.limit {
            reduced.subs = self.limit_recurrence_set(obj, window, tz);
        } else {
            reduced.subs = obj
                .root
                .subs
                .iter()
                .filter_map(|sub| self.project_sub(sub))
                .collect();
        }

        Ok(reduced)
    }

    /// Expansion materializes instances: each occurrence in the window
    /// becomes its own component with concrete UTC times and its
    /// recurrence identity, and the generating rule properties are
    /// removed from the copies. Timezone components are dropped since
    /// every instance is in UTC.
    fn expand_instances(
        &self,
        obj: &CalObject,
        window: &TimeRange,
        tz: Tz,
    ) -> QueryResult<Vec<CalComponent>> {
        let occurrences = recur::occurrences_within(obj, window, tz)?;
        let master = match obj.master() {
            Some(m) => m,
            None => return Ok(Vec::new()),
        };
        let recurring = obj.is_recurring();

        let mut subs = Vec::new();
        for occ in occurrences {
            // An override supplies the copy for the slot it replaced, and
            // the instance keeps the RECURRENCE-ID of that original slot.
            let moved = obj.overrides.iter().find(|ov| {
                ov.start
                    .as_ref()
                    .map(|s| s.resolve(tz) == occ.start)
                    .unwrap_or(false)
            });
            let base = moved.map(|ov| &ov.comp).unwrap_or(master);
            let recurrence_id = moved
                .map(|ov| ov.recurrence_id.resolve(tz))
                .unwrap_or(occ.start);

            let instance = materialize(base, occ.start, occ.end, recurring, recurrence_id);
            match self.sub_spec(&instance.name) {
                SubSpec::All | SubSpec::Unspecified => subs.push(instance),
                SubSpec::Named(spec) => subs.push(spec.project(&instance)),
                SubSpec::Dropped => {}
            }
        }
        Ok(subs)
    }

    /// Limiting keeps the master (rule intact, for client-side expansion)
    /// and only those overrides whose effective time falls in the window.
    fn limit_recurrence_set(&self, obj: &CalObject, window: &TimeRange, tz: Tz) -> Vec<CalComponent> {
        obj.root
            .subs
            .iter()
            .filter(|sub| {
                let rid = sub.prop("RECURRENCE-ID");
                match rid {
                    None => true,
                    Some(_) => obj
                        .overrides
                        .iter()
                        .find(|ov| ov.comp == **sub)
                        .map(|ov| override_in_window(ov, window, tz))
                        .unwrap_or(true),
                }
            })
            .filter_map(|sub| self.project_sub(sub))
            .collect()
    }

    fn project_sub(&self, sub: &CalComponent) -> Option<CalComponent> {
        match self.sub_spec(&sub.name) {
            SubSpec::All | SubSpec::Unspecified => Some(sub.clone()),
            SubSpec::Named(spec) => Some(spec.project(sub)),
            SubSpec::Dropped => None,
        }
    }

    fn sub_spec(&self, name: &str) -> SubSpec<'_> {
        if self.all_sub_components {
            return SubSpec::All;
        }
        if self.sub_components.is_empty() {
            return SubSpec::Unspecified;
        }
        match self
            .sub_components
            .iter()
            .find(|s| s.comp_name.eq_ignore_ascii_case(name))
        {
            Some(spec) => SubSpec::Named(spec),
            None => SubSpec::Dropped,
        }
    }

    /// Apply this spec at its own component level.
    fn project(&self, comp: &CalComponent) -> CalComponent {
        CalComponent {
            name: comp.name.clone(),
            props: self.project_props(comp),
            subs: comp
                .subs
                .iter()
                .filter_map(|sub| self.project_sub(sub))
                .collect(),
        }
    }

    fn project_props(&self, comp: &CalComponent) -> Vec<CalProp> {
        if self.all_properties || self.properties.is_empty() {
            return comp.props.clone();
        }
        comp.props
            .iter()
            .filter_map(|prop| {
                self.properties
                    .iter()
                    .find(|spec| spec.name.eq_ignore_ascii_case(&prop.name))
                    .map(|spec| {
                        let mut kept = prop.clone();
                        if spec.no_value {
                            kept.value = String::new();
                        }
                        kept
                    })
            })
            .collect()
    }
}

enum SubSpec<'a> {
    All,
    Unspecified,
    Named(&'a OutputFilter),
    Dropped,
}

fn override_in_window(ov: &crate::object::OverrideInstance, window: &TimeRange, tz: Tz) -> bool {
    let start = ov.start.as_ref().unwrap_or(&ov.recurrence_id).resolve(tz);
    let end = ov.end.as_ref().map(|e| e.resolve(tz)).unwrap_or(start);
    recur::Occurrence { start, end }.intersects(window)
}

/// Copy a component for one expanded occurrence: concrete UTC start/end,
/// a RECURRENCE-ID identity, and no recurrence-generating properties.
fn materialize(
    base: &CalComponent,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    recurring: bool,
    recurrence_id: DateTime<Utc>,
) -> CalComponent {
    const STRIPPED: &[&str] = &[
        "RRULE",
        "RDATE",
        "EXDATE",
        "RECURRENCE-ID",
        "DTSTART",
        "DTEND",
        "DUE",
        "DURATION",
    ];

    let mut props: Vec<CalProp> = base
        .props
        .iter()
        .filter(|p| !STRIPPED.iter().any(|s| p.name.eq_ignore_ascii_case(s)))
        .cloned()
        .collect();

    props.push(utc_prop("DTSTART", start));
    if end > start {
        props.push(utc_prop("DTEND", end));
    }
    if recurring {
        props.push(utc_prop("RECURRENCE-ID", recurrence_id));
    }

    CalComponent {
        name: base.name.clone(),
        props,
        subs: base.subs.clone(),
    }
}

fn utc_prop(name: &str, value: DateTime<Utc>) -> CalProp {
    CalProp {
        name: name.to_string(),
        value: format!("{}Z", value.format("%Y%m%dT%H%M%S")),
        params: Vec::new(),
    }
}

fn comp_name_attr(elem: &Element) -> QueryResult<String> {
    elem.attributes.get("name").cloned().ok_or_else(|| {
        QueryError::UnsupportedFilterShape("comp element without a name".to_string())
    })
}

fn parse_comp(elem: &Element) -> QueryResult<OutputFilter> {
    let mut result = OutputFilter::new(comp_name_attr(elem)?);

    for child in child_elements(elem) {
        match child.name.as_str() {
            "allcomp" => result.set_all_sub_components()?,
            "allprop" => result.set_all_properties()?,
            "comp" => {
                let sub = parse_comp(child)?;
                result.add_sub_component(sub)?;
            }
            "prop" => {
                let name = comp_name_attr(child)?;
                let no_value = match child.attributes.get("novalue").map(|s| s.as_str()) {
                    None | Some("no") => false,
                    Some("yes") => true,
                    Some(other) => {
                        return Err(QueryError::UnsupportedFilterShape(format!(
                            "invalid novalue attribute: {}",
                            other
                        )));
                    }
                };
                result.add_property(name, no_value)?;
            }
            _ => {}
        }
    }

    Ok(result)
}

/// Expand/limit windows require explicit UTC start and end; no one-year
/// fallback applies here.
fn parse_period(elem: &Element) -> QueryResult<TimeRange> {
    let start = elem
        .attributes
        .get("start")
        .ok_or_else(|| QueryError::MalformedTimeRange("expected start attribute".to_string()))?;
    let end = elem
        .attributes
        .get("end")
        .ok_or_else(|| QueryError::MalformedTimeRange("expected end attribute".to_string()))?;
    TimeRange::new(parse_utc(start)?, parse_utc(end)?)
}
