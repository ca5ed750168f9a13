//! Bulk-load file reader
//!
//! Reads comma-separated files the way a warehouse bulk loader does: fields
//! may be enclosed in double quotes, records end with CRLF (a bare LF is also
//! accepted), and an unenclosed empty field is NULL while `""` is an empty
//! string.

use thiserror::Error;

/// One field; `None` is SQL NULL
pub type Field = Option<String>;

/// A parsed record and the line it starts on (1-based)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub line: usize,
    pub fields: Vec<Field>,
}

/// Malformed input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsvError {
    #[error("unterminated quoted field")]
    UnterminatedQuote { line: usize },

    #[error("unexpected character after closing quote")]
    TrailingAfterQuote { line: usize },
}

impl CsvError {
    /// Line the error was detected on
    pub fn line(&self) -> usize {
        match self {
            Self::UnterminatedQuote { line } | Self::TrailingAfterQuote { line } => *line,
        }
    }
}

/// How a field ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldEnd {
    Separator,
    Record,
    Eof,
}

/// Streaming reader over an in-memory file
pub struct CsvReader<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> CsvReader<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    /// Read the next record, skipping blank lines
    pub fn next_record(&mut self) -> Result<Option<Record>, CsvError> {
        loop {
            if self.pos >= self.input.len() {
                return Ok(None);
            }
            match self.terminator_len() {
                Some(len) => {
                    self.pos += len;
                    self.line += 1;
                }
                None => break,
            }
        }
        self.read_record().map(Some)
    }

    /// Read the record at the current position, even if its line is blank
    fn read_record(&mut self) -> Result<Record, CsvError> {
        let line = self.line;
        let mut fields = Vec::new();
        loop {
            let (field, end) = self.read_field()?;
            fields.push(field);
            if end != FieldEnd::Separator {
                break;
            }
        }

        Ok(Record { line, fields })
    }

    /// Read all remaining records after skipping exactly one header record
    ///
    /// The header is the first line of the file even when that line is blank.
    pub fn records_after_header(mut self) -> Result<Vec<Record>, CsvError> {
        if self.pos < self.input.len() {
            let _header = self.read_record()?;
        }
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    fn terminator_len(&self) -> Option<usize> {
        match self.input.get(self.pos) {
            Some(b'\n') => Some(1),
            Some(b'\r') if self.input.get(self.pos + 1) == Some(&b'\n') => Some(2),
            _ => None,
        }
    }

    /// Consume a field terminator at the current position, if there is one
    fn take_end(&mut self) -> Option<FieldEnd> {
        if self.pos >= self.input.len() {
            return Some(FieldEnd::Eof);
        }
        if self.input[self.pos] == b',' {
            self.pos += 1;
            return Some(FieldEnd::Separator);
        }
        let len = self.terminator_len()?;
        self.pos += len;
        self.line += 1;
        Some(FieldEnd::Record)
    }

    fn read_field(&mut self) -> Result<(Field, FieldEnd), CsvError> {
        if self.input.get(self.pos) == Some(&b'"') {
            return self.read_enclosed();
        }

        let start = self.pos;
        loop {
            let end_pos = self.pos;
            if let Some(end) = self.take_end() {
                let raw = &self.input[start..end_pos];
                let field = if raw.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(raw).into_owned())
                };
                return Ok((field, end));
            }
            self.pos += 1;
        }
    }

    fn read_enclosed(&mut self) -> Result<(Field, FieldEnd), CsvError> {
        let open_line = self.line;
        self.pos += 1;
        let mut buf = Vec::new();

        loop {
            let Some(&byte) = self.input.get(self.pos) else {
                return Err(CsvError::UnterminatedQuote { line: open_line });
            };
            if byte == b'"' {
                if self.input.get(self.pos + 1) == Some(&b'"') {
                    buf.push(b'"');
                    self.pos += 2;
                    continue;
                }
                self.pos += 1;
                break;
            }
            if byte == b'\n' {
                self.line += 1;
            }
            buf.push(byte);
            self.pos += 1;
        }

        let end = self
            .take_end()
            .ok_or(CsvError::TrailingAfterQuote { line: self.line })?;
        Ok((Some(String::from_utf8_lossy(&buf).into_owned()), end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(value: &str) -> Field {
        Some(value.to_string())
    }

    fn all(input: &str) -> Vec<Record> {
        let mut reader = CsvReader::new(input);
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_crlf_records() {
        let records = all("id,name\r\n1,a\r\n2,b\r\n");
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].fields, vec![s("1"), s("a")]);
        assert_eq!(records[2].line, 3);
    }

    #[test]
    fn test_bare_lf_accepted() {
        let records = all("id,name\n1,a\n");
        assert_eq!(records[1].fields, vec![s("1"), s("a")]);
    }

    #[test]
    fn test_no_trailing_terminator() {
        let records = all("id\r\n1\r\n2");
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].fields, vec![s("2")]);
    }

    #[test]
    fn test_empty_unquoted_is_null_and_quoted_is_empty() {
        let records = all("1,,\"\"\r\n");
        assert_eq!(records[0].fields, vec![s("1"), None, s("")]);
    }

    #[test]
    fn test_quoted_field_keeps_separators_and_newlines() {
        let records = all("1,\"Smith, John\",\"two\r\nlines\"\r\n2,x,y\r\n");
        assert_eq!(records[0].fields, vec![s("1"), s("Smith, John"), s("two\r\nlines")]);
        assert_eq!(records[1].line, 3);
    }

    #[test]
    fn test_doubled_quote_is_literal() {
        let records = all("\"say \"\"hi\"\"\"\r\n");
        assert_eq!(records[0].fields, vec![s("say \"hi\"")]);
    }

    #[test]
    fn test_quote_inside_unenclosed_field_is_data() {
        let records = all("12\" pipe,x\r\n");
        assert_eq!(records[0].fields, vec![s("12\" pipe"), s("x")]);
    }

    #[test]
    fn test_lone_cr_is_data() {
        let records = all("a\rb,c\r\n");
        assert_eq!(records[0].fields, vec![s("a\rb"), s("c")]);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let records = all("h\r\n\r\n1\r\n\r\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].line, 3);
    }

    #[test]
    fn test_unterminated_quote() {
        let mut reader = CsvReader::new("h\r\n\"open,1\r\n");
        reader.next_record().unwrap();
        let err = reader.next_record().unwrap_err();
        assert_eq!(err, CsvError::UnterminatedQuote { line: 2 });
    }

    #[test]
    fn test_trailing_after_quote() {
        let err = CsvReader::new("\"a\"b,c\r\n").next_record().unwrap_err();
        assert_eq!(err.line(), 1);
        assert!(matches!(err, CsvError::TrailingAfterQuote { .. }));
    }

    #[test]
    fn test_records_after_header_skips_one_record() {
        let records = CsvReader::new("K,V\r\n1,b\r\n2,c\r\n").records_after_header().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fields, vec![s("1"), s("b")]);
    }

    #[test]
    fn test_blank_first_line_is_the_header() {
        let records = CsvReader::new("\r\nk,v\r\n1,a\r\n").records_after_header().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].line, 2);
        assert_eq!(records[0].fields, vec![s("k"), s("v")]);
    }

    #[test]
    fn test_header_only_file_has_no_records() {
        let records = CsvReader::new("K,V\r\n").records_after_header().unwrap();
        assert!(records.is_empty());
    }
}
