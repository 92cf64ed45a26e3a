//! Run-time diagnostics.
//!
//! One [`RuntimeError`] per failed opcode contract (spec.md §7); the VM
//! attaches the failing line and a snapshot of the call-frame stack so the
//! caller can print a traceback without the frame stack still being alive.
//! Hand-rolled `struct` + `Display`, matching `ember-compiler`'s
//! `CompileError` rather than reaching for `thiserror`.

/// One entry of a run-time traceback: the line active in that frame and
/// the name of the function it belongs to (`None` for top-level script
/// code, matching spec.md §7's `in <function name or "script">`).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "report-json", derive(serde::Serialize))]
pub struct FrameInfo {
    pub line: u32,
    pub function_name: Option<String>,
}

impl std::fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.function_name.as_deref().unwrap_or("script");
        write!(f, "[Line {}] in {}", self.line, name)
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "report-json", derive(serde::Serialize))]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    /// Innermost frame first, matching the top-to-bottom walk spec.md §7
    /// prescribes for the printed traceback.
    pub trace: Vec<FrameInfo>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        RuntimeError { message: message.into(), line, trace: Vec::new() }
    }

    /// Renders the one-line-per-frame traceback spec.md §7 describes:
    /// the failing message first, then each frame prefixed `[Line n]`.
    pub fn render(&self) -> String {
        let mut out = format!("[Line {}] {}\n", self.line, self.message);
        for frame in &self.trace {
            out.push_str(&frame.to_string());
            out.push('\n');
        }
        out
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Line {}] {}", self.line, self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Serializes the error as the `EMBER_REPORT=json` structured diagnostic,
/// one JSON object per error, matching `render`'s field order.
#[cfg(feature = "report-json")]
impl RuntimeError {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
