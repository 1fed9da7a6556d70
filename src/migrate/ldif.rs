//! LDIF record streaming
//!
//! A record is a run of lines terminated by a blank line. The blank line
//! belongs to the record it closes. Only one record is held in memory.

use std::io::BufRead;

use crate::error::Result;

/// Reads one LDIF record at a time from a buffered source
pub struct RecordReader<R> {
    reader: R,
    done: bool,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        RecordReader {
            reader,
            done: false,
        }
    }

    /// Next record, or `None` at end of input
    ///
    /// A final record without a terminating blank line is still returned.
    pub fn next_record(&mut self) -> Result<Option<Vec<String>>> {
        if self.done {
            return Ok(None);
        }

        let mut lines = Vec::new();
        let mut buf = String::new();
        loop {
            buf.clear();
            if self.reader.read_line(&mut buf)? == 0 {
                self.done = true;
                break;
            }
            let line = buf.trim_end_matches(['\n', '\r']).to_string();
            let blank = line.is_empty();
            lines.push(line);
            if blank {
                break;
            }
        }

        Ok(if lines.is_empty() { None } else { Some(lines) })
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Cursor over the lines of one record
///
/// Handlers for folded attributes pull their continuation lines through
/// [`LineCursor::take_continuation_lines`]; the first line that is not a
/// continuation stays in place for the next handler.
#[derive(Debug)]
pub struct LineCursor {
    lines: Vec<String>,
    pos: usize,
}

impl LineCursor {
    pub fn new(lines: Vec<String>) -> Self {
        LineCursor { lines, pos: 0 }
    }

    pub fn peek(&self) -> Option<&str> {
        self.lines.get(self.pos).map(String::as_str)
    }

    pub fn next_line(&mut self) -> Option<String> {
        let line = self.lines.get_mut(self.pos).map(std::mem::take)?;
        self.pos += 1;
        Some(line)
    }

    /// Consume the lines that continue the current attribute (leading space)
    pub fn take_continuation_lines(&mut self) -> Vec<String> {
        let mut continued = Vec::new();
        while self.peek().map_or(false, |line| line.starts_with(' ')) {
            if let Some(line) = self.next_line() {
                continued.push(line);
            }
        }
        continued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_records_split_on_blank_lines() {
        let input = "dn: cn=1,ou=kra\ncn: 1\n\ndn: cn=2,ou=kra\r\ncn: 2\r\n\r\n";
        let records: Vec<_> = RecordReader::new(Cursor::new(input))
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0], vec!["dn: cn=1,ou=kra", "cn: 1", ""]);
        assert_eq!(records[1], vec!["dn: cn=2,ou=kra", "cn: 2", ""]);
    }

    #[test]
    fn test_final_record_without_blank_line() {
        let input = "dn: cn=1\n\ndn: cn=2\ncn: 2";
        let mut reader = RecordReader::new(Cursor::new(input));
        reader.next_record().unwrap();
        assert_eq!(
            reader.next_record().unwrap(),
            Some(vec!["dn: cn=2".to_string(), "cn: 2".to_string()])
        );
        assert_eq!(reader.next_record().unwrap(), None);
    }

    #[test]
    fn test_cursor_continuation() {
        let mut cursor = LineCursor::new(vec![
            "extdata-requestnotes: first".to_string(),
            " second".to_string(),
            "  third".to_string(),
            "requestId: 0273".to_string(),
        ]);

        assert_eq!(cursor.next_line().as_deref(), Some("extdata-requestnotes: first"));
        assert_eq!(cursor.take_continuation_lines(), vec![" second", "  third"]);
        assert_eq!(cursor.peek(), Some("requestId: 0273"));
        assert!(cursor.take_continuation_lines().is_empty());
        assert_eq!(cursor.next_line().as_deref(), Some("requestId: 0273"));
        assert_eq!(cursor.next_line(), None);
    }
}
