//! Error provenance across asynchronous boundaries.
//!
//! An [`Omen`] is captured at the start of an operation that may fail later,
//! after the caller's stack is gone. When the failure materialises the omen
//! is *consumed* by [`Omen::customize`], producing a [`Fault`] that carries
//! the original call site and stack. Because customizing moves the omen, a
//! second customization does not compile.

use crate::error::{ContractError, FaultKind, MachineError};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::Location;

/// Symbol prefixes whose frames carry no diagnostic value for callers.
const INTERNAL_FRAME_PREFIXES: &[&str] = &[
    "switchback::",
    "<switchback::",
    "std::backtrace",
    "<std::backtrace",
    "std::backtrace_rs::",
    "anyhow::",
    "<anyhow::",
    "core::ops::function::",
    "<alloc::boxed::Box<F,A> as core::ops::function::",
];

/// A placeholder captured early solely to preserve a call stack.
pub struct Omen {
    origin: &'static Location<'static>,
    backtrace: Backtrace,
}

impl Omen {
    /// Capture the caller's location, and a backtrace when `RUST_BACKTRACE` enables it.
    #[track_caller]
    pub fn capture() -> Self {
        Self {
            origin: Location::caller(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Capture the caller's location, forcing a backtrace when `force` is set.
    #[track_caller]
    pub fn capture_with(force: bool) -> Self {
        Self {
            origin: Location::caller(),
            backtrace: if force {
                Backtrace::force_capture()
            } else {
                Backtrace::capture()
            },
        }
    }

    pub fn origin(&self) -> &'static Location<'static> {
        self.origin
    }

    /// Turn this omen into the fault it foretold.
    pub fn customize(self, error: MachineError) -> Fault {
        let frames = match self.backtrace.status() {
            BacktraceStatus::Captured => external_frames(&self.backtrace.to_string()),
            _ => Vec::new(),
        };
        Fault {
            error,
            origin: self.origin,
            frames,
        }
    }
}

impl fmt::Debug for Omen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Omen").field("origin", &self.origin).finish()
    }
}

/// A surfaced fault: the error plus where it was foretold.
pub struct Fault {
    error: MachineError,
    origin: &'static Location<'static>,
    frames: Vec<String>,
}

impl Fault {
    /// Build a fault whose provenance is the current call site.
    #[track_caller]
    pub fn new(error: MachineError) -> Self {
        Omen::capture().customize(error)
    }

    pub fn error(&self) -> &MachineError {
        &self.error
    }

    pub fn into_error(self) -> MachineError {
        self.error
    }

    pub fn code(&self) -> &'static str {
        self.error.code()
    }

    pub fn kind(&self) -> FaultKind {
        self.error.kind()
    }

    /// Where the omen behind this fault was captured.
    pub fn origin(&self) -> &'static Location<'static> {
        self.origin
    }

    /// Captured frames outside the engine's internals (empty when no backtrace was taken).
    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    /// The message spliced onto the captured stack.
    pub fn stack(&self) -> String {
        let mut out = format!("{}: {}\n    at {}", self.code(), self.error, self.origin);
        for frame in &self.frames {
            out.push('\n');
            out.push_str(frame);
        }
        out
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("code", &self.code())
            .field("error", &self.error)
            .field("origin", &self.origin)
            .finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.error)
    }
}

impl From<MachineError> for Fault {
    #[track_caller]
    fn from(error: MachineError) -> Self {
        Self::new(error)
    }
}

impl From<ContractError> for Fault {
    #[track_caller]
    fn from(error: ContractError) -> Self {
        Self::new(MachineError::Contract(error))
    }
}

/// Split a rendered backtrace into frames and drop the internal ones.
///
/// Each frame is a numbered symbol line followed by indented `at` lines.
fn external_frames(rendered: &str) -> Vec<String> {
    let mut frames: Vec<String> = Vec::new();
    let mut current: Option<String> = None;

    for line in rendered.lines() {
        let trimmed = line.trim_start();
        if let Some(symbol) = frame_symbol(trimmed) {
            if let Some(frame) = current.take() {
                frames.push(frame);
            }
            current = Some(format!("    {symbol}"));
        } else if let Some(frame) = current.as_mut() {
            frame.push_str("\n        ");
            frame.push_str(trimmed);
        }
    }
    if let Some(frame) = current {
        frames.push(frame);
    }

    frames
        .into_iter()
        .filter(|frame| !is_internal(frame.trim_start()))
        .collect()
}

/// `"12: some::symbol"` → `Some("some::symbol")`.
fn frame_symbol(line: &str) -> Option<&str> {
    let (index, symbol) = line.split_once(": ")?;
    (!index.is_empty() && index.chars().all(|c| c.is_ascii_digit())).then_some(symbol)
}

fn is_internal(frame: &str) -> bool {
    INTERNAL_FRAME_PREFIXES
        .iter()
        .any(|prefix| frame.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDERED: &str = "   0: std::backtrace_rs::backtrace::libunwind::trace
             at /rustc/abc/library/std/src/../../backtrace/src/backtrace/libunwind.rs:116:5
   1: std::backtrace::Backtrace::create
             at /rustc/abc/library/std/src/backtrace.rs:331:13
   2: switchback::provenance::Omen::capture_with
             at ./src/provenance.rs:40:17
   3: my_app::handlers::create_user
             at ./src/handlers.rs:88:9
   4: <switchback::supervisor::LiveInstance>::exec
             at ./src/supervisor.rs:10:5
   5: my_app::main
             at ./src/main.rs:12:5";

    #[test]
    fn test_internal_frames_are_stripped() {
        let frames = external_frames(RENDERED);
        assert_eq!(frames.len(), 2, "{frames:#?}");
        assert!(frames[0].contains("my_app::handlers::create_user"));
        assert!(frames[0].contains("./src/handlers.rs:88:9"));
        assert!(frames[1].contains("my_app::main"));
    }

    #[test]
    fn test_frame_symbol_parsing() {
        assert_eq!(frame_symbol("3: my_app::run"), Some("my_app::run"));
        assert_eq!(frame_symbol("at ./src/main.rs:1:1"), None);
        assert_eq!(frame_symbol(": nothing"), None);
    }

    #[test]
    fn test_customize_keeps_capture_site() {
        let omen = Omen::capture();
        let line = line!() - 1;
        let fault = omen.customize(MachineError::usage("late failure"));
        assert_eq!(fault.origin().line(), line);
        assert_eq!(fault.code(), "E_USAGE");
        assert!(fault.stack().starts_with("E_USAGE: late failure\n    at "));
    }

    #[test]
    fn test_forced_capture_drops_engine_frames() {
        let fault = Omen::capture_with(true).customize(MachineError::usage("forced"));
        assert!(fault
            .frames()
            .iter()
            .all(|frame| !frame.trim_start().starts_with("switchback::")));
    }

    #[test]
    fn test_from_machine_error_tracks_caller() {
        let fault = Fault::from(MachineError::usage("converted"));
        assert!(fault.origin().file().ends_with("provenance.rs"));
    }
}
