//! The line protocol: `<command> <json>` in, tagged lines out.

use std::io::{self, Write};

/// Shown for a line without a space.
pub const EXPECTED: &str = "Expected '<command> <json>'.";
/// Shown for a command with nothing after the space.
pub const MISSING_PAYLOAD: &str = "Missing JSON payload.";

/// One input line, classified.
#[derive(Debug, PartialEq, Eq)]
pub enum Line<'a> {
    /// Nothing to do.
    Blank,
    /// A command and its raw payload.
    Command { name: &'a str, payload: &'a str },
    /// A malformed line and the diagnostic for it.
    Invalid(&'static str),
}

/// Classify `raw`, ignoring a trailing line ending.
pub fn parse(raw: &str) -> Line<'_> {
    let line = raw.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        return Line::Blank;
    }
    match line.split_once(' ') {
        None => Line::Invalid(EXPECTED),
        Some((_, "")) => Line::Invalid(MISSING_PAYLOAD),
        Some((name, payload)) => Line::Command { name, payload },
    }
}

fn tagged(out: &mut impl Write, head: &str, data: &[u8]) -> io::Result<()> {
    out.write_all(head.as_bytes())?;
    out.write_all(data)?;
    out.write_all(b"\n")?;
    out.flush()
}

/// `[event] command=<name> request_id=<id> data=<bytes>`
pub fn write_event(out: &mut impl Write, command: &str, request_id: i64, data: &[u8]) -> io::Result<()> {
    tagged(
        out,
        &format!("[event] command={command} request_id={request_id} data="),
        data,
    )
}

/// `[response] command=<name> data=<bytes>`
pub fn write_response(out: &mut impl Write, command: &str, data: &[u8]) -> io::Result<()> {
    tagged(out, &format!("[response] command={command} data="), data)
}

/// `[progress] <value>`
pub fn write_progress(out: &mut impl Write, value: f64) -> io::Result<()> {
    writeln!(out, "[progress] {value}")?;
    out.flush()
}
