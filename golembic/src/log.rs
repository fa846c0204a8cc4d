use std::fmt;

/// A sink for user-facing operation output.
///
/// The manager reports progress ("Applying …", "No migrations to run; …")
/// and the describe / verify / version listings through this trait, so
/// embedding applications can redirect or capture that output.
pub trait LogSink {
    fn log(&self, message: fmt::Arguments<'_>);
}

/// The default sink; writes each message to standard output with a trailing
/// newline.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutLog;

impl LogSink for StdoutLog {
    fn log(&self, message: fmt::Arguments<'_>) {
        println!("{message}");
    }
}
