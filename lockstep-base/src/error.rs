// One error type for the whole workspace. Three requirements drive it:
// every error carries a backtrace from the moment it is created; there is
// a single constructor to put a breakpoint on when hunting one down; and
// each error is emitted into the tracing system as it is made, so nothing
// fails silently on a worker thread.

use backtrace_error::DynBacktraceError;
use std::borrow::Cow;
use tracing::error;

#[derive(Debug)]
#[allow(dead_code)]
pub struct Error(DynBacktraceError);
pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
        error!(target: "lockstep", "{:?}", err);
        Error(DynBacktraceError::from(err))
    }
}

// Ad-hoc errors from a message, for conditions with no underlying cause.
pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(SimpleErr(msg.into()))
}
