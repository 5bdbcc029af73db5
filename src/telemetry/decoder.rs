use crate::error::DecodeError;

use super::record::TelemetryRecord;

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

pub(crate) const TRUNCATED_SUFFIX: &str = "...[truncated]";

/// Outcome of decoding one complete stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    Record(TelemetryRecord),
    Log(String),
}

/// Reassembles newline-terminated lines from arbitrarily split byte chunks.
#[derive(Debug)]
pub struct LineSplitter {
    partial: Vec<u8>,
    max_line_bytes: usize,
    truncated: bool,
}

/// A complete line as produced by [`LineSplitter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub text: String,
    pub truncated: bool,
}

impl RawLine {
    /// The text to show for this line, marked when it was cut short.
    pub fn into_text(self) -> String {
        if self.truncated {
            format!("{}{}", self.text, TRUNCATED_SUFFIX)
        } else {
            self.text
        }
    }
}

impl LineSplitter {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            partial: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawLine> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.append(&rest[..pos]);
            lines.push(self.take_line());
            rest = &rest[pos + 1..];
        }
        self.append(rest);

        lines
    }

    /// Emit whatever is buffered as a final line. Nothing is returned when the
    /// stream ended on a newline.
    pub fn finish(&mut self) -> Option<RawLine> {
        if self.partial.is_empty() && !self.truncated {
            return None;
        }
        Some(self.take_line())
    }

    pub fn reset(&mut self) {
        self.partial.clear();
        self.truncated = false;
    }

    pub fn pending_bytes(&self) -> usize {
        self.partial.len()
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    fn append(&mut self, bytes: &[u8]) {
        let room = self.max_line_bytes.saturating_sub(self.partial.len());
        if bytes.len() > room {
            self.partial.extend_from_slice(&bytes[..room]);
            self.truncated = true;
        } else {
            self.partial.extend_from_slice(bytes);
        }
    }

    fn take_line(&mut self) -> RawLine {
        let mut bytes = std::mem::take(&mut self.partial);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        let truncated = std::mem::replace(&mut self.truncated, false);
        RawLine {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            truncated,
        }
    }
}

/// Turns raw stdout chunks into records, demoting anything that fails to
/// decode to a log line.
#[derive(Debug)]
pub struct LineDecoder {
    splitter: LineSplitter,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            splitter: LineSplitter::new(max_line_bytes),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedLine> {
        let limit = self.splitter.max_line_bytes();
        self.splitter
            .push(chunk)
            .into_iter()
            .map(|line| decode_line(line, limit))
            .collect()
    }

    pub fn finish(&mut self) -> Option<DecodedLine> {
        let limit = self.splitter.max_line_bytes();
        self.splitter.finish().map(|line| decode_line(line, limit))
    }

    /// Drop a buffered partial line without decoding it.
    pub fn reset(&mut self) {
        self.splitter.reset();
    }

    pub fn pending_bytes(&self) -> usize {
        self.splitter.pending_bytes()
    }
}

fn decode_line(line: RawLine, limit: usize) -> DecodedLine {
    match classify(&line, limit) {
        Ok(record) => DecodedLine::Record(record),
        Err(err) => {
            log::debug!("stdout line demoted to log: {err}");
            DecodedLine::Log(line.into_text())
        }
    }
}

fn classify(line: &RawLine, limit: usize) -> Result<TelemetryRecord, DecodeError> {
    if line.truncated {
        return Err(DecodeError::Truncated { limit });
    }
    if line.text.trim().is_empty() {
        return Err(DecodeError::Blank);
    }
    TelemetryRecord::from_json(&line.text)
}
