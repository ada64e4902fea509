//! Classification of script output lines.
//!
//! Scripts report through line prefixes on standard output:
//!
//! | prefix | meaning |
//! |---|---|
//! | `DEBUG:` | debug message |
//! | `VERBOSE:` | verbose message |
//! | `WARNING:` | warning |
//! | `ERROR:` | error |
//! | `PROGRESS: <percent> <activity>` | progress update |
//! | `OUTPUT:` | structured output value |
//!
//! Unprefixed lines are information. Every standard error line is an error.

use crate::job::{EventEmitter, LogLevel, ProgressEvent};

/// Stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One classified line of script output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptMessage {
    /// A log message at a fixed level.
    Log(LogLevel, String),
    /// A verbose message.
    Verbose(String),
    /// A progress update.
    Progress(ProgressEvent),
    /// A structured output value.
    Output(String),
}

fn strip<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix).map(str::trim_start)
}

fn parse_progress(rest: &str) -> ProgressEvent {
    let (head, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    match head.trim_end_matches('%').parse::<u8>() {
        Ok(percent) => ProgressEvent {
            percent_complete: Some(percent.min(100)),
            activity: Some(tail.trim()).filter(|a| !a.is_empty()).map(String::from),
        },
        Err(_) => ProgressEvent {
            percent_complete: None,
            activity: Some(rest.trim()).filter(|a| !a.is_empty()).map(String::from),
        },
    }
}

/// Classifies one line of script output.
#[must_use]
pub fn classify(line: &str, stream: ScriptStream) -> ScriptMessage {
    if stream == ScriptStream::Stderr {
        return ScriptMessage::Log(LogLevel::Error, line.to_string());
    }

    if let Some(rest) = strip(line, "DEBUG:") {
        ScriptMessage::Log(LogLevel::Debug, rest.to_string())
    } else if let Some(rest) = strip(line, "VERBOSE:") {
        ScriptMessage::Verbose(rest.to_string())
    } else if let Some(rest) = strip(line, "WARNING:") {
        ScriptMessage::Log(LogLevel::Warning, rest.to_string())
    } else if let Some(rest) = strip(line, "ERROR:") {
        ScriptMessage::Log(LogLevel::Error, rest.to_string())
    } else if let Some(rest) = strip(line, "PROGRESS:") {
        ScriptMessage::Progress(parse_progress(rest))
    } else if let Some(rest) = strip(line, "OUTPUT:") {
        ScriptMessage::Output(rest.to_string())
    } else {
        ScriptMessage::Log(LogLevel::Information, line.to_string())
    }
}

/// Routes classified messages to the job's event stream and accumulates
/// outputs.
#[derive(Debug)]
pub struct OutputCollector {
    include_debug: bool,
    include_verbose: bool,
    collect_output: bool,
    outputs: Vec<String>,
}

impl OutputCollector {
    /// Creates a collector with the given capture flags.
    #[must_use]
    pub const fn new(include_debug: bool, include_verbose: bool, collect_output: bool) -> Self {
        Self {
            include_debug,
            include_verbose,
            collect_output,
            outputs: Vec::new(),
        }
    }

    /// Forwards or collects one message.
    pub fn accept(&mut self, message: ScriptMessage, events: &EventEmitter) {
        match message {
            ScriptMessage::Log(LogLevel::Debug, text) => {
                if self.include_debug {
                    events.debug(text);
                }
            }
            ScriptMessage::Log(level, text) => events.log(level, text),
            ScriptMessage::Verbose(text) => {
                if self.include_verbose {
                    events.debug(format!("VERBOSE: {text}"));
                }
            }
            ScriptMessage::Progress(progress) => {
                events.progress(progress.percent_complete, progress.activity);
            }
            ScriptMessage::Output(value) => {
                if self.collect_output {
                    self.outputs.push(value);
                } else {
                    events.info(value);
                }
            }
        }
    }

    /// Returns the collected outputs in emission order.
    #[must_use]
    pub fn finish(self) -> Vec<String> {
        self.outputs
    }
}
