use std::{error::Error, fmt::Display};

/// Everything that can go wrong while driving the terminal.
#[derive(Debug)]
pub enum MonitorError {
    /// Returned when the terminal cannot be set up, drawn, or polled.
    IOError(std::io::Error),
}

impl Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#?}", self)
    }
}

impl Error for MonitorError {}

impl From<std::io::Error> for MonitorError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}
