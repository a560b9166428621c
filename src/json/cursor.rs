//! Byte cursor over an immutable input buffer.

/// Read position into a byte slice.
///
/// The parser never mutates its input; it moves this cursor forward and
/// rewinds it when a string has to be scanned a second time.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            position: 0,
            line: 1,
        }
    }

    pub fn peek(&self) -> Option<u8> {
        self.bytes.get(self.position).copied()
    }

    pub fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.position + offset).copied()
    }

    /// Consume and return the next byte. Newlines bump the line counter.
    pub fn advance(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.position += 1;
        if byte == b'\n' {
            self.line += 1;
        }
        Some(byte)
    }

    /// Move back to an earlier position, restoring the line counter.
    pub fn rewind(&mut self, position: usize) {
        let position = position.min(self.position);
        let crossed = self.bytes[position..self.position]
            .iter()
            .filter(|&&b| b == b'\n')
            .count();
        self.line -= crossed;
        self.position = position;
    }

    pub fn skip(&mut self, count: usize) {
        for _ in 0..count {
            if self.advance().is_none() {
                break;
            }
        }
    }

    pub fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\r' | b'\n') = self.peek() {
            self.advance();
        }
    }

    /// Case-insensitive match of `word` at the current position.
    pub fn starts_with_ignore_case(&self, word: &[u8]) -> bool {
        self.remaining().len() >= word.len()
            && self.remaining()[..word.len()].eq_ignore_ascii_case(word)
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.position..]
    }

    pub fn slice(&self, from: usize) -> &'a [u8] {
        &self.bytes[from..self.position]
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Current line, starting at 1.
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn is_at_end(&self) -> bool {
        self.position >= self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewind_restores_line() {
        let mut cursor = Cursor::new(b"a\nb\nc");
        cursor.skip(4);
        assert_eq!(cursor.line(), 3);
        cursor.rewind(1);
        assert_eq!(cursor.line(), 1);
        assert_eq!(cursor.peek(), Some(b'\n'));
    }

    #[test]
    fn test_starts_with_ignore_case() {
        let cursor = Cursor::new(b"TrUe,");
        assert!(cursor.starts_with_ignore_case(b"true"));
        assert!(!cursor.starts_with_ignore_case(b"false"));
    }
}
