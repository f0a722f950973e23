use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink};

/// How the binary reports a stage: progress lines on stderr or a JSON report on stdout.
#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Progress,
    Json,
}

/// Machine-readable mode: progress events are dropped, reports go to stdout.
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

/// Human mode: one line per progress event on stderr.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let line = match event.elapsed {
            Some(elapsed) => format!(
                "[{}] {} ({:.1}s)",
                event.stage,
                event.message,
                elapsed.as_secs_f64()
            ),
            None => format!("[{}] {}", event.stage, event.message),
        };
        let _ = writeln!(io::stderr(), "{line}");
    }
}
