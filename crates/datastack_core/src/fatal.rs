//! Fatal error reporting.
//!
//! Configuration errors, unrecoverable store corruption and confinement
//! violations are programming or deployment errors. They are logged with
//! `status=fatal` and then abort the current thread by panicking; when file
//! logging is active the logging panic hook records the panic as well.

use log::error;
use std::fmt::Display;

pub(crate) fn fatal(event: &str, message: impl Display) -> ! {
    error!("event={event} module=datastack status=fatal error={message}");
    panic!("{event}: {message}");
}
