//! # Error Kinds
//!
//! Every fallible operation in the engine returns `eyre::Result`. When a
//! failure has a meaning callers can act on (retry, run repair, reject the
//! request), the report carries an [`ErrorKind`] as its root cause so it can
//! be recovered with `Report::downcast_ref::<ErrorKind>()`.
//!
//! ```ignore
//! match table_result {
//!     Err(e) if e.downcast_ref::<ErrorKind>() == Some(&ErrorKind::TableInUse) => {
//!         // previous session did not close cleanly; run repair first
//!     }
//!     other => other?,
//! }
//! ```
//!
//! Plain `eyre!`/`wrap_err` context without a kind means an internal
//! condition no caller is expected to branch on.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("operation failed due to invalid parameters")]
    InvalidParameters,

    #[error("container accessed outside its bounds")]
    InvalidAccessPosition,

    #[error("container file family is inconsistent")]
    ContainerInvalid,

    #[error("container request failed due to an OS file error")]
    FileOsIoError,

    #[error("table header is invalid")]
    TableInvalid,

    #[error("table is in use or was not closed properly")]
    TableInUse,

    #[error("table parameters do not match the database settings")]
    TableInconsistency,

    #[error("field name is not a valid identifier")]
    FieldNameInvalid,

    #[error("field name is duplicated")]
    FieldNameDuplicated,

    #[error("field type is unknown or not allowed")]
    FieldTypeInvalid,

    #[error("code point is not a valid Unicode character")]
    InvalidUnicodeChar,

    #[error("internal invariant violated")]
    GeneralControlError,
}

/// Builds a report rooted at `kind` with a formatted context message.
macro_rules! fail {
    ($kind:expr, $($arg:tt)*) => {
        return Err(eyre::Report::new($kind).wrap_err(format!($($arg)*)))
    };
}

pub(crate) use fail;
