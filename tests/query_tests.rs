//! End-to-end calendar-query tests: XML filter in, iCalendar objects in,
//! match decisions and projected output out.

use caldav_query::filter::CalendarFilter;
use caldav_query::object::CalObject;
use caldav_query::output::OutputFilter;
use caldav_query::{eval, prefilter, QueryError};
use chrono_tz::Tz;
use http::StatusCode;
use xmltree::Element;

fn object(ics: &str) -> CalObject {
    let _ = env_logger::builder().is_test(true).try_init();
    CalObject::from_ics(ics).unwrap()
}

fn query(xml: &str) -> CalendarFilter {
    query_in_tz(xml, None)
}

fn query_in_tz(xml: &str, timezone: Option<Tz>) -> CalendarFilter {
    let elem = Element::parse(xml.as_bytes()).unwrap();
    CalendarFilter::from_element(&elem, timezone).unwrap()
}

fn vevent(body: &str) -> String {
    format!(
        "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\n\
         BEGIN:VEVENT\r\n{}\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n",
        body.trim_end()
    )
}

const UID_FILTER: &str = r#"<filter xmlns="urn:ietf:params:xml:ns:caldav">
  <comp-filter name="VCALENDAR">
    <comp-filter name="VEVENT">
      <prop-filter name="UID">
        <text-match>event-1@example.com</text-match>
      </prop-filter>
    </comp-filter>
  </comp-filter>
</filter>"#;

#[test]
fn uid_query_selects_the_right_object() {
    let q = query(UID_FILTER);
    let hit = object(&vevent(
        "UID:event-1@example.com\r\nDTSTART:20240301T090000Z\r\nSUMMARY:Standup",
    ));
    let miss = object(&vevent(
        "UID:event-2@example.com\r\nDTSTART:20240301T090000Z\r\nSUMMARY:Standup",
    ));

    assert!(eval::matches(&hit, &q).unwrap());
    assert!(!eval::matches(&miss, &q).unwrap());

    // The same query narrows at the storage layer.
    let pre = prefilter::translate(&q).unwrap().unwrap();
    assert!(pre.accepts(&hit));
    assert!(!pre.accepts(&miss));
}

#[test]
fn text_match_defaults_to_caseless() {
    let q = query(
        r#"<filter>
          <comp-filter name="VCALENDAR">
            <comp-filter name="VEVENT">
              <prop-filter name="SUMMARY">
                <text-match>standup</text-match>
              </prop-filter>
            </comp-filter>
          </comp-filter>
        </filter>"#,
    );
    let obj = object(&vevent(
        "UID:a@b\r\nDTSTART:20240301T090000Z\r\nSUMMARY:Daily STANDUP call",
    ));
    assert!(eval::matches(&obj, &q).unwrap());
}

#[test]
fn negated_octet_match_is_exact() {
    let q = query(
        r#"<filter>
          <comp-filter name="VCALENDAR">
            <comp-filter name="VEVENT">
              <prop-filter name="SUMMARY">
                <text-match collation="i;octet" negate-condition="yes">STANDUP</text-match>
              </prop-filter>
            </comp-filter>
          </comp-filter>
        </filter>"#,
    );
    // Lowercase does not contain the octet sequence, so negate matches.
    let lower = object(&vevent(
        "UID:a@b\r\nDTSTART:20240301T090000Z\r\nSUMMARY:standup",
    ));
    let upper = object(&vevent(
        "UID:a@b\r\nDTSTART:20240301T090000Z\r\nSUMMARY:STANDUP",
    ));
    assert!(eval::matches(&lower, &q).unwrap());
    assert!(!eval::matches(&upper, &q).unwrap());
}

#[test]
fn unknown_collation_is_rejected_with_forbidden() {
    let elem = Element::parse(
        r#"<filter>
          <comp-filter name="VCALENDAR">
            <comp-filter name="VEVENT">
              <prop-filter name="SUMMARY">
                <text-match collation="i;unicode-casemap">x</text-match>
              </prop-filter>
            </comp-filter>
          </comp-filter>
        </filter>"#
            .as_bytes(),
    )
    .unwrap();
    let err = CalendarFilter::from_element(&elem, None).unwrap_err();
    assert!(matches!(err, QueryError::UnsupportedCollation(_)));
    assert_eq!(err.statuscode(), StatusCode::FORBIDDEN);
}

fn time_range_filter(start: &str, end: &str) -> CalendarFilter {
    query(&format!(
        r#"<filter>
          <comp-filter name="VCALENDAR">
            <comp-filter name="VEVENT">
              <time-range start="{}" end="{}"/>
            </comp-filter>
          </comp-filter>
        </filter>"#,
        start, end
    ))
}

#[test]
fn time_range_interval_is_half_open() {
    let obj = object(&vevent(
        "UID:a@b\r\nDTSTART:20240110T120000Z\r\nDTEND:20240110T130000Z\r\nSUMMARY:Lunch",
    ));

    // Event starts exactly when the range ends: no overlap.
    let q = time_range_filter("20240110T110000Z", "20240110T120000Z");
    assert!(!eval::matches(&obj, &q).unwrap());

    // Event ends exactly when the range starts: no overlap.
    let q = time_range_filter("20240110T130000Z", "20240110T140000Z");
    assert!(!eval::matches(&obj, &q).unwrap());

    // One second of overlap is enough.
    let q = time_range_filter("20240110T125959Z", "20240110T140000Z");
    assert!(eval::matches(&obj, &q).unwrap());
}

#[test]
fn recurring_event_matches_a_window_far_past_its_start() {
    let obj = object(&vevent(
        "UID:weekly@b\r\nDTSTART:20240101T100000Z\r\nDTEND:20240101T110000Z\r\nRRULE:FREQ=WEEKLY",
    ));
    let q = time_range_filter("20240304T000000Z", "20240311T000000Z");
    assert!(eval::matches(&obj, &q).unwrap());

    // The storage prefilter must not lose it either: the rule is
    // unbounded, so any window after the first occurrence is a maybe.
    let pre = prefilter::translate(&q).unwrap().unwrap();
    assert!(pre.accepts(&obj));
}

#[test]
fn excluded_occurrence_does_not_match() {
    let obj = object(&vevent(
        "UID:weekly@b\r\nDTSTART:20240101T100000Z\r\nDTEND:20240101T110000Z\r\n\
         RRULE:FREQ=WEEKLY\r\nEXDATE:20240115T100000Z",
    ));
    let q = time_range_filter("20240115T000000Z", "20240116T000000Z");
    assert!(!eval::matches(&obj, &q).unwrap());

    let q = time_range_filter("20240108T000000Z", "20240109T000000Z");
    assert!(eval::matches(&obj, &q).unwrap());
}

#[test]
fn moved_override_matches_its_new_slot_only() {
    let ics = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\n\
BEGIN:VEVENT\r\nUID:weekly@b\r\nDTSTART:20240101T100000Z\r\nDTEND:20240101T110000Z\r\n\
RRULE:FREQ=WEEKLY\r\nEND:VEVENT\r\n\
BEGIN:VEVENT\r\nUID:weekly@b\r\nRECURRENCE-ID:20240108T100000Z\r\n\
DTSTART:20240110T100000Z\r\nDTEND:20240110T110000Z\r\nEND:VEVENT\r\n\
END:VCALENDAR\r\n";
    let obj = object(ics);

    // The original Jan 8 slot is vacated.
    let q = time_range_filter("20240108T000000Z", "20240109T000000Z");
    assert!(!eval::matches(&obj, &q).unwrap());

    // The moved instance shows up on Jan 10.
    let q = time_range_filter("20240110T000000Z", "20240111T000000Z");
    assert!(eval::matches(&obj, &q).unwrap());
}

#[test]
fn floating_times_follow_the_query_timezone() {
    let obj = object(&vevent(
        "UID:float@b\r\nDTSTART:20240610T120000\r\nDTEND:20240610T130000\r\nSUMMARY:Lunch",
    ));
    let xml = r#"<filter>
      <comp-filter name="VCALENDAR">
        <comp-filter name="VEVENT">
          <time-range start="20240610T153000Z" end="20240610T163000Z"/>
        </comp-filter>
      </comp-filter>
    </filter>"#;

    // Noon in New York (EDT) is 16:00 UTC, inside the window.
    let ny = query_in_tz(xml, Some(chrono_tz::America::New_York));
    assert!(eval::matches(&obj, &ny).unwrap());

    // Interpreted as UTC the event is long over by 15:30.
    let utc = query_in_tz(xml, None);
    assert!(!eval::matches(&obj, &utc).unwrap());
}

#[test]
fn todo_component_filter_ignores_events() {
    let q = query(
        r#"<filter>
          <comp-filter name="VCALENDAR">
            <comp-filter name="VTODO"/>
          </comp-filter>
        </filter>"#,
    );
    let todo = object(
        "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\n\
         BEGIN:VTODO\r\nUID:t@b\r\nDUE:20240301T090000Z\r\nSUMMARY:Ship it\r\n\
         END:VTODO\r\nEND:VCALENDAR\r\n",
    );
    let event = object(&vevent("UID:a@b\r\nDTSTART:20240301T090000Z"));

    assert!(eval::matches(&todo, &q).unwrap());
    assert!(!eval::matches(&event, &q).unwrap());

    let pre = prefilter::translate(&q).unwrap().unwrap();
    assert!(pre.accepts(&todo));
    assert!(!pre.accepts(&event));
}

#[test]
fn prefilter_never_drops_a_matching_object() {
    let objects = vec![
        object(&vevent("UID:a@b\r\nDTSTART:20240101T100000Z\r\nSUMMARY:Planning")),
        object(&vevent(
            "UID:b@b\r\nDTSTART:20240201T100000Z\r\nDTEND:20240201T120000Z\r\nSUMMARY:Review",
        )),
        object(&vevent(
            "UID:c@b\r\nDTSTART:20240101T100000Z\r\nDTEND:20240101T110000Z\r\nRRULE:FREQ=DAILY;COUNT=40\r\nSUMMARY:Standup",
        )),
        object(&vevent("UID:d@b\r\nDTSTART:20240610T120000\r\nSUMMARY:Floating")),
    ];
    let queries = vec![
        query(UID_FILTER),
        time_range_filter("20240201T110000Z", "20240202T000000Z"),
        time_range_filter("20240205T000000Z", "20240206T000000Z"),
        query(
            r#"<filter>
              <comp-filter name="VCALENDAR">
                <comp-filter name="VEVENT">
                  <prop-filter name="SUMMARY">
                    <text-match>review</text-match>
                  </prop-filter>
                </comp-filter>
              </comp-filter>
            </filter>"#,
        ),
    ];

    for q in &queries {
        let pre = prefilter::translate(q).unwrap();
        for obj in &objects {
            if eval::matches(obj, q).unwrap() {
                assert!(
                    pre.as_ref().map_or(true, |p| p.accepts(obj)),
                    "prefilter dropped a matching object (uid {:?})",
                    obj.uid
                );
            }
        }
    }
}

#[test]
fn prefilter_keeps_overrides_moved_outside_the_series_span() {
    // Two January instances, the second moved to June by an override:
    // the June window must survive storage narrowing.
    let ics = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\n\
BEGIN:VEVENT\r\nUID:moved@b\r\nDTSTART:20240101T100000Z\r\nDTEND:20240101T110000Z\r\n\
RRULE:FREQ=WEEKLY;COUNT=2\r\nSUMMARY:Series\r\nEND:VEVENT\r\n\
BEGIN:VEVENT\r\nUID:moved@b\r\nRECURRENCE-ID:20240108T100000Z\r\n\
DTSTART:20240601T100000Z\r\nDTEND:20240601T110000Z\r\nSUMMARY:Moved\r\nEND:VEVENT\r\n\
END:VCALENDAR\r\n";
    let obj = object(ics);
    let q = time_range_filter("20240601T000000Z", "20240602T000000Z");

    assert!(eval::matches(&obj, &q).unwrap());
    let pre = prefilter::translate(&q).unwrap().unwrap();
    assert!(pre.accepts(&obj));
}

#[test]
fn query_with_expansion_produces_concrete_instances() {
    let obj = object(&vevent(
        "UID:weekly@b\r\nDTSTART:20240101T100000Z\r\nDTEND:20240101T110000Z\r\nRRULE:FREQ=WEEKLY",
    ));
    let q = time_range_filter("20240101T000000Z", "20240122T000000Z");
    assert!(eval::matches(&obj, &q).unwrap());

    let cdata = Element::parse(
        r#"<calendar-data>
          <expand start="20240101T000000Z" end="20240122T000000Z"/>
        </calendar-data>"#
            .as_bytes(),
    )
    .unwrap();
    let projection = OutputFilter::from_element(&cdata).unwrap().unwrap();
    let reduced = projection.apply(&obj, chrono_tz::UTC).unwrap();

    assert_eq!(reduced.subs.len(), 3);
    let starts: Vec<&str> = reduced
        .subs
        .iter()
        .map(|c| c.prop("DTSTART").unwrap().value.as_str())
        .collect();
    assert_eq!(
        starts,
        vec!["20240101T100000Z", "20240108T100000Z", "20240115T100000Z"]
    );
    for instance in &reduced.subs {
        assert!(instance.prop("RRULE").is_none());
        assert!(instance.prop("RECURRENCE-ID").is_some());
    }
}

#[test]
fn malformed_calendar_data_reports_unprocessable() {
    let err = CalObject::from_ics("BEGIN:VCALENDAR\r\nnot an icalendar stream").unwrap_err();
    assert!(matches!(err, QueryError::InvalidCalendarData(_)));
    assert_eq!(err.statuscode(), StatusCode::UNPROCESSABLE_ENTITY);
}
