//! # User script preparation and error attribution.
//!
//! - [`CombinedScript`] `preamble + user script + postamble`, with the offsets
//!   needed to map compiled line numbers back to the user's code
//! - [`attribute_error`] turns a captured traceback into `Error on Line {n}: {msg}`
//! - [`unescape_error_line`] decodes the single-line escaped error text sent over the FIFO

mod attribution;
mod combine;

pub use attribution::{attribute_error, parse_traceback, unescape_error_line, Traceback};
pub use combine::{CombinedScript, count_lines};
