use std::io::{self, IsTerminal, Write};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Stage,
    Success,
    Warning,
    Error,
    Raw,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Info | Level::Stage => "INFO",
            Level::Success => "SUCCESS",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Raw => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub level: Level,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Level::Info, message)
    }

    pub fn stage(message: impl Into<String>) -> Self {
        Self::new(Level::Stage, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(Level::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Level::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Level::Error, message)
    }

    pub fn raw(message: impl Into<String>) -> Self {
        Self::new(Level::Raw, message)
    }

    pub fn to_line(&self) -> String {
        match self.level {
            Level::Raw => self.message.clone(),
            Level::Info | Level::Stage | Level::Success => self.message.clone(),
            Level::Warning => format!("Warning: {}", self.message),
            Level::Error => format!("Error: {}", self.message),
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Console,
    Json,
}

pub struct ConsoleOutput {
    color: bool,
}

impl ConsoleOutput {
    pub fn new() -> Self {
        Self {
            color: io::stdout().is_terminal(),
        }
    }

    fn paint(&self, level: Level) -> (&'static str, &'static str) {
        if !self.color {
            return ("", "");
        }
        let color = match level {
            Level::Info => "\x1b[96m",
            Level::Stage => "\x1b[94m",
            Level::Success => "\x1b[92m",
            Level::Warning => "\x1b[93m",
            Level::Error => "\x1b[91m",
            Level::Raw => return ("", ""),
        };
        (color, "\x1b[0m")
    }

    pub fn banner(&self, lines: &[&str]) {
        let (color, reset) = if self.color {
            ("\x1b[92m\x1b[1m", "\x1b[0m")
        } else {
            ("", "")
        };
        for line in lines {
            println!("{color}{line}{reset}");
        }
    }
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        let mut stdout = io::stdout().lock();
        if event.level == Level::Raw {
            let _ = writeln!(stdout, "{}", event.message);
            return;
        }
        let (color, reset) = self.paint(event.level);
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let _ = writeln!(
            stdout,
            "{color}[{timestamp}] {}: {}{reset}",
            event.level.as_str(),
            event.message
        );
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_prefix_warnings_and_errors() {
        assert_eq!(ProgressEvent::info("ok").to_line(), "ok");
        assert_eq!(
            ProgressEvent::warning("no mappings").to_line(),
            "Warning: no mappings"
        );
        assert_eq!(
            ProgressEvent::error("missing file").to_line(),
            "Error: missing file"
        );
        assert_eq!(ProgressEvent::raw("  Subject 1").to_line(), "  Subject 1");
    }
}
