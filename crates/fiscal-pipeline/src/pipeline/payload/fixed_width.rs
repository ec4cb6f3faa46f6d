/// Fixed-width text record addressed with 1-based column positions, as in
/// banking interchange layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWidthRecord {
    buffer: Vec<u8>,
}

impl FixedWidthRecord {
    pub fn new(width: usize) -> Self {
        Self {
            buffer: vec![b' '; width],
        }
    }

    pub fn width(&self) -> usize {
        self.buffer.len()
    }

    /// Left-aligned, upper-cased ASCII text truncated to `len` columns.
    pub fn text(mut self, start: usize, len: usize, value: &str) -> Self {
        let sanitized = value
            .chars()
            .map(|ch| {
                if ch.is_ascii_graphic() || ch == ' ' {
                    ch.to_ascii_uppercase()
                } else {
                    ' '
                }
            })
            .take(len)
            .collect::<String>();
        self.write(start, len, sanitized.as_bytes());
        self
    }

    /// Right-aligned, zero-padded unsigned number.
    pub fn number(mut self, start: usize, len: usize, value: u64) -> Self {
        let rendered = format!("{value:0len$}");
        let bytes = rendered.as_bytes();
        let tail = &bytes[bytes.len().saturating_sub(len)..];
        self.write(start, len, tail);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_str(&self) -> &str {
        // Only ASCII is ever written into the buffer.
        std::str::from_utf8(&self.buffer).unwrap_or_default()
    }

    fn write(&mut self, start: usize, len: usize, bytes: &[u8]) {
        let Some(offset) = start.checked_sub(1) else {
            return;
        };
        let end = (offset + len).min(self.buffer.len());
        if offset >= end {
            return;
        }
        let target = &mut self.buffer[offset..end];
        target.fill(b' ');
        let count = bytes.len().min(target.len());
        target[..count].copy_from_slice(&bytes[..count]);
    }
}
