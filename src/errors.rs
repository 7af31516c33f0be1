use std::error::Error;

use http::StatusCode;

/// Errors produced while building or evaluating a calendar query.
///
/// Construction-time errors (filter model, projection spec) are returned
/// to the caller immediately; the caller is expected to map them onto a
/// client-facing response via [`QueryError::statuscode`]. The one
/// evaluation-time error, `InvalidRecurrenceRule`, is normally caught per
/// candidate object and downgraded to a non-match.
#[derive(Debug)]
pub enum QueryError {
    /// A text-match collation identifier outside the supported set.
    UnsupportedCollation(String),
    /// A component filter naming anything but the supported containers.
    UnsupportedComponent(String),
    /// A property filter the storage translator cannot represent.
    UnsupportedPropertyFilter(String),
    /// A filter combination with no defined semantics.
    UnsupportedFilterShape(String),
    /// calendar-data with a content type or version we do not serve.
    UnsupportedCalendarData(String),
    /// Stored iCalendar text that does not parse.
    InvalidCalendarData(String),
    /// A recurrence rule the expander cannot evaluate.
    InvalidRecurrenceRule(String),
    /// Both an expand and a limit-recurrence-set window were supplied.
    ConflictingProjectionOptions,
    /// A time-range missing its start, or with a non-UTC start/end.
    MalformedTimeRange(String),
}

pub type QueryResult<T> = Result<T, QueryError>;

impl Error for QueryError {}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            QueryError::UnsupportedCollation(c) => write!(f, "unsupported collation: {}", c),
            QueryError::UnsupportedComponent(c) => write!(f, "unsupported component filter: {}", c),
            QueryError::UnsupportedPropertyFilter(p) => write!(f, "unsupported prop filter: {}", p),
            QueryError::UnsupportedFilterShape(s) => write!(f, "unsupported filter: {}", s),
            QueryError::UnsupportedCalendarData(d) => {
                write!(f, "unsupported calendar data: {}", d)
            }
            QueryError::InvalidCalendarData(e) => write!(f, "invalid calendar data: {}", e),
            QueryError::InvalidRecurrenceRule(e) => write!(f, "invalid recurrence rule: {}", e),
            QueryError::ConflictingProjectionOptions => {
                write!(f, "expand and limit-recurrence-set are mutually exclusive")
            }
            QueryError::MalformedTimeRange(e) => write!(f, "malformed time-range: {}", e),
        }
    }
}

impl QueryError {
    /// Map this error onto the HTTP status a protocol layer should answer
    /// with. Collation failures get 403 per the RFC 4791
    /// supported-collation precondition; broken stored objects are 422;
    /// everything else is a plain bad request.
    pub fn statuscode(&self) -> StatusCode {
        match self {
            QueryError::UnsupportedCollation(_) => StatusCode::FORBIDDEN,
            QueryError::InvalidCalendarData(_) => StatusCode::UNPROCESSABLE_ENTITY,
            QueryError::InvalidRecurrenceRule(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}
