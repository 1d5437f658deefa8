//! Provide interoperability with C return values.

use std::io::{self, Error as IoError};

/// Converts a non-zero C return value to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_err<T>(code: i32) -> io::Result<T> {
    Err(IoError::from_raw_os_error(code))
}
