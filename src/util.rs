//! Workflow log annotations for the hosting CI.
//!
//! All three stoker entry points run as CI jobs; notices and warnings
//! use the runner's `::directive::` stdout protocol so they surface in
//! the job summary instead of being buried in the log stream.

/// Format a notice annotation line.
pub fn notice_line(title: &str, message: &str) -> String {
    format!("::notice title={title}::{message}")
}

/// Format a warning annotation line.
pub fn warning_line(title: &str, message: &str) -> String {
    format!("::warning title={title}::{message}")
}

/// Emit a notice annotation.
pub fn notice(title: &str, message: &str) {
    println!("{}", notice_line(title, message));
}

/// Emit a warning annotation.
pub fn warning(title: &str, message: &str) {
    println!("{}", warning_line(title, message));
}

/// A collapsible log group. The group is opened on construction and
/// closed when the guard is dropped, so it closes on the error path too.
pub struct LogGroup;

impl LogGroup {
    pub fn open(name: &str) -> Self {
        println!("::group::{name}");
        Self
    }
}

impl Drop for LogGroup {
    fn drop(&mut self) {
        println!("::endgroup::");
    }
}
