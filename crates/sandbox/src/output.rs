//! Exec output buffer: aggregated transcript plus a truncation cap and a
//! short normalized tail for exit notifications.
//!
//! Grounded on `sa_tools::manager::OutputBuffer`, with the cap resolved as
//! a single `totalOutputChars` ceiling (200,000) rather than per-chunk, per
//! the Open Question resolution in DESIGN.md, plus a separate fixed-size
//! notification tail the teacher's buffer doesn't carry.

/// Fixed tail length used for the exit-notification system event (spec §4.F
/// step 11), independent of the `OutputBuffer`'s own truncation cap.
pub const NOTIFICATION_TAIL_CHARS: usize = 400;

pub struct OutputBuffer {
    combined: String,
    max_chars: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            combined: String::new(),
            max_chars,
            truncated: false,
        }
    }

    /// Append text, dropping the oldest content once `max_chars` is
    /// exceeded and latching `truncated`.
    pub fn push(&mut self, text: &str) {
        self.combined.push_str(text);
        if self.combined.len() > self.max_chars {
            self.truncated = true;
            let keep = self.max_chars * 3 / 4;
            let drain_count = self.combined.len() - keep;
            let mut boundary = drain_count;
            while boundary < self.combined.len() && !self.combined.is_char_boundary(boundary) {
                boundary += 1;
            }
            self.combined.drain(..boundary);
        }
    }

    pub fn len(&self) -> usize {
        self.combined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combined.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn aggregated(&self) -> &str {
        &self.combined
    }

    /// Last `lines` newline-delimited lines (used by the `process` tool's
    /// default log tail).
    pub fn tail_lines(&self, lines: usize) -> String {
        let all_lines: Vec<&str> = self.combined.lines().collect();
        if all_lines.len() <= lines {
            self.combined.clone()
        } else {
            all_lines[all_lines.len() - lines..].join("\n")
        }
    }

    /// Last `chars` characters, char-boundary safe.
    pub fn tail_chars(&self, chars: usize) -> &str {
        if self.combined.len() <= chars {
            return &self.combined;
        }
        let mut boundary = self.combined.len() - chars;
        while boundary < self.combined.len() && !self.combined.is_char_boundary(boundary) {
            boundary += 1;
        }
        &self.combined[boundary..]
    }

    pub fn read_from(&self, offset: usize, limit: Option<usize>) -> &str {
        let start = offset.min(self.combined.len());
        let end = match limit {
            Some(l) => (start + l).min(self.combined.len()),
            None => self.combined.len(),
        };
        &self.combined[start..end]
    }

    /// A single-line, whitespace-collapsed tail suitable for the exit
    /// notification event text (spec §4.F step 11).
    pub fn normalized_notification_tail(&self) -> String {
        let tail = self.tail_chars(NOTIFICATION_TAIL_CHARS);
        tail.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_accumulates_under_cap() {
        let mut buf = OutputBuffer::new(100);
        buf.push("hello ");
        buf.push("world");
        assert_eq!(buf.aggregated(), "hello world");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn push_truncates_and_latches_flag_past_cap() {
        let mut buf = OutputBuffer::new(10);
        buf.push("0123456789");
        buf.push("abcdefghij");
        assert!(buf.is_truncated());
        assert!(buf.len() <= 10);
    }

    #[test]
    fn tail_chars_is_char_boundary_safe() {
        let mut buf = OutputBuffer::new(1000);
        buf.push("héllo wörld");
        let tail = buf.tail_chars(4);
        assert!(std::str::from_utf8(tail.as_bytes()).is_ok());
    }

    #[test]
    fn normalized_notification_tail_collapses_whitespace() {
        let mut buf = OutputBuffer::new(1000);
        buf.push("line one\n\nline   two\n");
        assert_eq!(buf.normalized_notification_tail(), "line one line two");
    }

    #[test]
    fn read_from_respects_offset_and_limit() {
        let mut buf = OutputBuffer::new(1000);
        buf.push("abcdefghij");
        assert_eq!(buf.read_from(3, Some(4)), "defg");
        assert_eq!(buf.read_from(8, None), "ij");
    }
}
