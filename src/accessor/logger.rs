use core::fmt::{self, Write};

const LOG_LENGTH_MAX: usize = 0x20;
const LOG_COUNT_MAX: usize = 0x10;

#[derive(Clone, Copy)]
struct Entry {
    text: [u8; LOG_LENGTH_MAX],
    len: usize,
}

impl Entry {
    const EMPTY: Entry = Entry {
        text: [0; LOG_LENGTH_MAX],
        len: 0,
    };

    fn as_bytes(&self) -> &[u8] {
        &self.text[..self.len]
    }
}

/// Formats into an entry, dropping whatever does not fit. One byte is kept
/// back so an entry never exceeds what a C string of the same size holds.
impl Write for Entry {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LOG_LENGTH_MAX - 1 - self.len;
        let n = s.len().min(room);
        self.text[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Ring of short failure notes, newest overwriting oldest.
pub struct ErrorLogger {
    logs: [Entry; LOG_COUNT_MAX],
    index: usize,
}

impl Default for ErrorLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorLogger {
    pub const fn new() -> Self {
        Self {
            logs: [Entry::EMPTY; LOG_COUNT_MAX],
            index: 0,
        }
    }

    fn clear(&mut self) {
        self.logs = [Entry::EMPTY; LOG_COUNT_MAX];
        self.index = 0;
    }

    pub fn push(&mut self, args: fmt::Arguments<'_>) {
        let mut entry = Entry::EMPTY;
        let _ = entry.write_fmt(args);
        self.logs[self.index] = entry;
        self.index = (self.index + 1) % LOG_COUNT_MAX;
    }

    pub fn has_log(&self) -> bool {
        let last = (self.index + LOG_COUNT_MAX - 1) % LOG_COUNT_MAX;
        self.logs[last].len != 0
    }

    fn pop(&mut self) -> Option<Entry> {
        self.index = (self.index + LOG_COUNT_MAX - 1) % LOG_COUNT_MAX;
        let entry = self.logs[self.index];
        if entry.len == 0 {
            return None;
        }
        self.logs[self.index] = Entry::EMPTY;
        Some(entry)
    }

    /// Drain the ring into `dst`, newest first, separated by ", " and
    /// NUL-terminated. Returns the length written including the NUL.
    pub fn get_and_clear_logs(&mut self, dst: &mut [u8]) -> usize {
        assert!(!dst.is_empty(), "log buffer is empty");
        let mut total = 0;
        let mut first = true;
        while let Some(entry) = self.pop() {
            let sep: &[u8] = if first { b"" } else { b", " };
            let room = dst.len() - 1 - total;
            if room <= sep.len() {
                break;
            }
            dst[total..total + sep.len()].copy_from_slice(sep);
            total += sep.len();
            let text = entry.as_bytes();
            let n = text.len().min(room - sep.len());
            dst[total..total + n].copy_from_slice(&text[..n]);
            total += n;
            if n < text.len() {
                break;
            }
            first = false;
        }
        dst[total] = 0;
        self.clear();
        total + 1
    }
}
