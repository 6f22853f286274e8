//! Keyboard-wedge RFID reader.
//!
//! Most desk readers enumerate as a HID keyboard and "type" the card number
//! followed by Enter. Point the reader at the input device's tty (or any
//! line-oriented stream) and each non-blank line is one scan.

use std::fs::File;
use std::io::{BufRead, BufReader};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("failed to open reader {0}: {1}")]
    Open(String, std::io::Error),
    #[error("reader read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("reader disconnected")]
    Disconnected,
}

/// Line-oriented card reader over any buffered input.
pub struct CardReader<R> {
    input: R,
    line: String,
}

impl CardReader<BufReader<File>> {
    /// Open a reader device or FIFO by path.
    pub fn open(path: &str) -> Result<Self, ReaderError> {
        let file = File::open(path).map_err(|e| ReaderError::Open(path.to_string(), e))?;
        tracing::info!(device = path, "card reader opened");
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> CardReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line: String::new(),
        }
    }

    /// Block until the next scan. Returns the raw (untrimmed, unvalidated) text.
    ///
    /// End of input means the reader went away.
    pub fn next_scan(&mut self) -> Result<String, ReaderError> {
        loop {
            self.line.clear();
            if self.input.read_line(&mut self.line)? == 0 {
                return Err(ReaderError::Disconnected);
            }
            if !self.line.trim().is_empty() {
                return Ok(self.line.trim_end_matches(['\r', '\n']).to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reads_one_scan_per_line() {
        let mut reader = CardReader::new(Cursor::new("0004567890\r\nA1\n"));
        assert_eq!(reader.next_scan().unwrap(), "0004567890");
        assert_eq!(reader.next_scan().unwrap(), "A1");
    }

    #[test]
    fn test_skips_blank_lines() {
        let mut reader = CardReader::new(Cursor::new("\n   \nA1\n"));
        assert_eq!(reader.next_scan().unwrap(), "A1");
    }

    #[test]
    fn test_eof_is_disconnect() {
        let mut reader = CardReader::new(Cursor::new("A1\n"));
        reader.next_scan().unwrap();
        assert!(matches!(reader.next_scan(), Err(ReaderError::Disconnected)));
    }

    #[test]
    fn test_last_line_without_newline() {
        let mut reader = CardReader::new(Cursor::new("B2"));
        assert_eq!(reader.next_scan().unwrap(), "B2");
    }
}
