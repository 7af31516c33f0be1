//! `CalDAV` (RFC4791) calendar-query filtering and recurrence expansion.
//!
//! This crate implements the server side of the CALDAV:calendar-query
//! REPORT: it parses the filter tree from the request body, evaluates it
//! against stored iCalendar objects, and projects the matching objects
//! through the requested calendar-data reduction. It is a library, not a
//! server: you feed it xmltree elements and raw iCalendar text, it gives
//! you match decisions and reduced components.
//!
//! The pieces, in pipeline order:
//!
//! - [`filter`]: the query model. `CalendarFilter::from_element` parses a
//!   comp-filter/prop-filter/param-filter tree with text-match and
//!   time-range tests, including the `i;ascii-casemap` and `i;octet`
//!   collations.
//! - [`object`]: a queryable view of one stored object.
//!   `CalObject::from_ics` parses the iCalendar text and pulls out the
//!   fields the engine needs (times, recurrence properties, overrides).
//! - [`prefilter`]: translates a filter into a coarse, index-friendly
//!   predicate for the storage layer. It only ever narrows soundly; when
//!   the filter is too rich to translate it says so and the caller scans
//!   everything.
//! - [`recur`]: recurrence expansion via the `rrule` crate. Computes the
//!   occurrences of an object inside a window, with RDATE/EXDATE and
//!   RECURRENCE-ID overrides applied.
//! - [`eval`]: the exact evaluator. `eval::matches` decides whether an
//!   object satisfies a filter, expanding recurrences for time-range
//!   tests as needed.
//! - [`output`]: calendar-data projection. Component/property reduction,
//!   recurrence expansion into concrete instances, and
//!   limit-recurrence-set.
//!
//! Times are handled per RFC4791: time-range tests use half-open UTC
//! intervals, and floating or date-only values are resolved in the
//! query's timezone (CALDAV:timezone, defaulting to UTC).
//!
//! ```
//! use caldav_query::{eval, filter::CalendarFilter, object::CalObject, prefilter};
//!
//! let xml = br#"<filter xmlns="urn:ietf:params:xml:ns:caldav">
//!   <comp-filter name="VCALENDAR">
//!     <comp-filter name="VEVENT">
//!       <prop-filter name="UID">
//!         <text-match>deadbeef</text-match>
//!       </prop-filter>
//!     </comp-filter>
//!   </comp-filter>
//! </filter>"#;
//! let elem = xmltree::Element::parse(&xml[..]).unwrap();
//! let query = CalendarFilter::from_element(&elem, None).unwrap();
//!
//! let ics = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:example\r\n\
//! BEGIN:VEVENT\r\nUID:deadbeef\r\nDTSTART:20240101T100000Z\r\n\
//! END:VEVENT\r\nEND:VCALENDAR\r\n";
//! let obj = CalObject::from_ics(ics).unwrap();
//!
//! // Optional: narrow the candidate set at the storage layer first.
//! let narrowing = prefilter::translate(&query).unwrap();
//! assert!(narrowing.map_or(true, |p| p.accepts(&obj)));
//!
//! assert!(eval::matches(&obj, &query).unwrap());
//! ```

mod errors;

pub mod eval;
pub mod filter;
pub mod object;
pub mod output;
pub mod prefilter;
pub mod recur;

pub use crate::errors::{QueryError, QueryResult};
