//! Cursor-based reader for the serialization grammar shared by the turn
//! snapshot stream and the action log.
//!
//! ```text
//! integer   i:<signed digits>;
//! float     d:<decimal>;
//! string    s:<byte length>:"<bytes>";
//! null      N;
//! record    O:<name length>:"<name>":<field count>:{ <key><value>... }
//! array     a:<count>:{ i:<index>;<value>... }
//! ```
//!
//! Every read advances one byte cursor over the whole text. Running off the
//! end of the buffer is reported as a malformed record.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1, line_ending},
    combinator::{map, map_res, opt, recognize},
    multi::many0_count,
    sequence::{delimited, pair, preceded, terminated},
};

use crate::error::{Error, ErrorKind, IResult};

/// Stands in for each byte of an invalid UTF-8 sequence, keeping byte
/// offsets intact. String reads drop it.
pub const INVALID_BYTE: char = '\0';

/// Decodes `raw` as UTF-8. Bytes that do not form a character, such as the
/// tail of a character the server cut in half, become [`INVALID_BYTE`] one
/// for one so declared string lengths still line up.
pub fn decode_text(raw: Vec<u8>) -> String {
    match String::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => {
            let raw = e.into_bytes();
            let mut text = String::with_capacity(raw.len());
            for chunk in raw.utf8_chunks() {
                text.push_str(chunk.valid());
                text.extend(std::iter::repeat_n(INVALID_BYTE, chunk.invalid().len()));
            }
            text
        }
    }
}

fn signed_digits(input: &str) -> IResult<'_, &str> {
    recognize(pair(opt(char('-')), digit1))(input)
}

fn length(input: &str) -> IResult<'_, usize> {
    map_res(digit1, str::parse::<usize>)(input)
}

fn integer(input: &str) -> IResult<'_, i64> {
    delimited(tag("i:"), map_res(signed_digits, str::parse::<i64>), char(';'))(input)
}

fn float(input: &str) -> IResult<'_, f64> {
    let decimal = recognize(pair(signed_digits, opt(pair(char('.'), digit1))));
    delimited(tag("d:"), map_res(decimal, str::parse::<f64>), char(';'))(input)
}

fn null(input: &str) -> IResult<'_, ()> {
    map(tag("N;"), |_| ())(input)
}

fn string_header(input: &str) -> IResult<'_, usize> {
    delimited(tag("s:"), length, tag(":\""))(input)
}

fn array_header(input: &str) -> IResult<'_, usize> {
    delimited(tag("a:"), length, tag(":{"))(input)
}

fn collection_end(input: &str) -> IResult<'_, ()> {
    map(char('}'), |_| ())(input)
}

fn line_breaks(input: &str) -> IResult<'_, usize> {
    many0_count(alt((line_ending, tag("\r"))))(input)
}

fn at_offset(e: Error, offset: usize) -> Error {
    match e.kind {
        ErrorKind::MalformedRecord { detail } => {
            Error::malformed(format!("{detail} (offset {offset})"))
        }
        kind => kind.into(),
    }
}

/// Interprets the single-character flag strings used for booleans.
pub fn parse_flag(value: &str) -> Result<bool, Error> {
    match value {
        "Y" | "y" => Ok(true),
        "N" | "n" => Ok(false),
        other => Err(Error::malformed(format!(
            "expected a Y/N flag, found {other:?}"
        ))),
    }
}

pub struct FormatDecoder<'a> {
    text: &'a str,
    cursor: usize,
}

impl<'a> FormatDecoder<'a> {
    pub fn new(text: &'a str) -> Self {
        FormatDecoder { text, cursor: 0 }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> &'a str {
        &self.text[self.cursor..]
    }

    pub fn is_at_end(&self) -> bool {
        self.cursor >= self.text.len()
    }

    /// Runs a nom parser at the cursor and advances past whatever it consumed.
    pub fn run<T, P>(&mut self, mut parser: P) -> Result<T, Error>
    where
        P: FnMut(&'a str) -> IResult<'a, T>,
    {
        let input = self.remaining();
        match parser(input) {
            Ok((rest, value)) => {
                self.cursor += input.len() - rest.len();
                Ok(value)
            }
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(at_offset(e, self.cursor)),
            Err(nom::Err::Incomplete(_)) => Err(Error::malformed(format!(
                "unexpected end of input at offset {}",
                self.cursor
            ))),
        }
    }

    pub fn peek_null(&self) -> bool {
        self.remaining().starts_with("N;")
    }

    pub fn expect_literal(&mut self, literal: &str) -> Result<(), Error> {
        self.run(|input| map(tag(literal), |_| ())(input))
    }

    pub fn read_int(&mut self) -> Result<i64, Error> {
        self.run(integer)
    }

    pub fn read_nullable_int(&mut self) -> Result<Option<i64>, Error> {
        self.run(alt((map(integer, Some), map(null, |_| None))))
    }

    pub fn read_float(&mut self) -> Result<f64, Error> {
        self.run(float)
    }

    pub fn read_nullable_float(&mut self) -> Result<Option<f64>, Error> {
        self.run(alt((map(float, Some), map(null, |_| None))))
    }

    /// Reads a length-prefixed string. The length counts UTF-8 bytes; when
    /// it ends inside a multi-byte character the content is cut back to the
    /// previous character boundary and the split character is skipped.
    /// Invalid bytes carried in from [`decode_text`] are dropped.
    pub fn read_string(&mut self) -> Result<String, Error> {
        let declared = self.run(string_header)?;
        let start = self.cursor;
        let end = start.checked_add(declared).filter(|end| *end <= self.text.len());
        let Some(end) = end else {
            return Err(Error::malformed(format!(
                "string of {declared} bytes at offset {start} overruns the buffer"
            )));
        };

        let mut content_end = end;
        while !self.text.is_char_boundary(content_end) {
            content_end -= 1;
        }
        let mut resume = end;
        while !self.text.is_char_boundary(resume) {
            resume += 1;
        }

        let content: String = self.text[start..content_end]
            .chars()
            .filter(|c| *c != INVALID_BYTE)
            .collect();
        self.cursor = resume;
        self.expect_literal("\";")?;
        Ok(content)
    }

    pub fn read_nullable_string(&mut self) -> Result<Option<String>, Error> {
        if self.peek_null() {
            self.run(null)?;
            return Ok(None);
        }
        self.read_string().map(Some)
    }

    pub fn read_bool(&mut self) -> Result<bool, Error> {
        let value = self.read_string()?;
        parse_flag(&value)
    }

    pub fn read_nullable_bool(&mut self) -> Result<Option<bool>, Error> {
        self.read_nullable_string()?
            .map(|value| parse_flag(&value))
            .transpose()
    }

    /// Reads `O:<len>:"<name>":<count>:{` for the given record name and
    /// returns the field count.
    pub fn read_record_start(&mut self, name: &str) -> Result<usize, Error> {
        let marker = format!("O:{}:\"{}\":", name.len(), name);
        self.run(|input| preceded(tag(marker.as_str()), terminated(length, tag(":{")))(input))
            .map_err(|e| match e.kind {
                ErrorKind::MalformedRecord { detail } => {
                    Error::malformed(format!("expected a {name} record: {detail}"))
                }
                kind => kind.into(),
            })
    }

    pub fn read_record_end(&mut self) -> Result<(), Error> {
        self.run(collection_end)
    }

    /// Reads `a:<count>:{` and returns the element count.
    pub fn read_array_start(&mut self) -> Result<usize, Error> {
        self.run(array_header)
    }

    /// Reads the `i:<index>;` prefix of an array element.
    pub fn read_array_index(&mut self) -> Result<i64, Error> {
        self.read_int()
    }

    pub fn read_array_end(&mut self) -> Result<(), Error> {
        self.run(collection_end)
    }

    /// Reads `p:<int>;d:<int>;a:` style line headers: a letter tag followed
    /// by a bare integer.
    pub fn read_tagged_int(&mut self, key: char) -> Result<i64, Error> {
        self.run(|input| {
            delimited(
                pair(char(key), char(':')),
                map_res(signed_digits, str::parse::<i64>),
                char(';'),
            )(input)
        })
    }

    pub fn skip_line_breaks(&mut self) -> Result<usize, Error> {
        self.run(line_breaks)
    }
}

#[cfg(test)]
mod tests {
    use crate::ErrorKind;

    use super::*;

    #[test]
    fn reads_integer_and_advances() {
        let mut decoder = FormatDecoder::new("i:42;");
        assert_eq!(decoder.read_int().unwrap(), 42);
        assert_eq!(decoder.position(), 5);
        assert!(decoder.is_at_end());
    }

    #[test]
    fn reads_negative_integer() {
        let mut decoder = FormatDecoder::new("i:-7;");
        assert_eq!(decoder.read_int().unwrap(), -7);
    }

    #[test]
    fn reads_null_integer() {
        let mut decoder = FormatDecoder::new("N;");
        assert_eq!(decoder.read_nullable_int().unwrap(), None);
        assert_eq!(decoder.position(), 2);
    }

    #[test]
    fn reads_string() {
        let mut decoder = FormatDecoder::new("s:3:\"cat\";");
        assert_eq!(decoder.read_string().unwrap(), "cat");
        assert!(decoder.is_at_end());
    }

    #[test]
    fn reads_multibyte_string_by_byte_length() {
        let mut decoder = FormatDecoder::new("s:5:\"h€y\";i:1;");
        assert_eq!(decoder.read_string().unwrap(), "h€y");
        assert_eq!(decoder.read_int().unwrap(), 1);
    }

    #[test]
    fn truncates_split_character() {
        // "€" is three bytes; a declared length of 4 ends inside it.
        let mut decoder = FormatDecoder::new("s:4:\"ab€\";i:9;");
        assert_eq!(decoder.read_string().unwrap(), "ab");
        assert_eq!(decoder.read_int().unwrap(), 9);
    }

    #[test]
    fn truncated_wire_character_is_dropped() {
        // A four-byte character cut to its first three bytes by the server.
        let raw = b"s:5:\"ab\xF0\x9F\x98\";i:9;".to_vec();
        let text = decode_text(raw);
        assert_eq!(text.len(), 15);

        let mut decoder = FormatDecoder::new(&text);
        assert_eq!(decoder.read_string().unwrap(), "ab");
        assert_eq!(decoder.read_int().unwrap(), 9);
    }

    #[test]
    fn valid_text_decodes_unchanged() {
        assert_eq!(decode_text("h€y".as_bytes().to_vec()), "h€y");
    }

    #[test]
    fn reads_flag_strings() {
        let mut decoder = FormatDecoder::new("s:1:\"Y\";s:1:\"n\";N;");
        assert!(decoder.read_bool().unwrap());
        assert_eq!(decoder.read_nullable_bool().unwrap(), Some(false));
        assert_eq!(decoder.read_nullable_bool().unwrap(), None);
    }

    #[test]
    fn rejects_non_flag_string() {
        let mut decoder = FormatDecoder::new("s:3:\"yes\";");
        let err = decoder.read_bool().unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MalformedRecord { .. }));
    }

    #[test]
    fn reads_float() {
        let mut decoder = FormatDecoder::new("d:9.5;d:10;");
        assert_eq!(decoder.read_float().unwrap(), 9.5);
        assert_eq!(decoder.read_float().unwrap(), 10.0);
    }

    #[test]
    fn string_overrun_is_malformed() {
        let mut decoder = FormatDecoder::new("s:40:\"short\";");
        let err = decoder.read_string().unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MalformedRecord { .. }));
    }

    #[test]
    fn truncated_integer_is_malformed() {
        let mut decoder = FormatDecoder::new("i:12");
        let err = decoder.read_int().unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MalformedRecord { .. }));
    }

    #[test]
    fn reads_record_and_array_frames() {
        let mut decoder = FormatDecoder::new("O:8:\"awbwUnit\":1:{s:2:\"id\";a:1:{i:0;i:5;}}");
        assert_eq!(decoder.read_record_start("awbwUnit").unwrap(), 1);
        assert_eq!(decoder.read_string().unwrap(), "id");
        assert_eq!(decoder.read_array_start().unwrap(), 1);
        assert_eq!(decoder.read_array_index().unwrap(), 0);
        assert_eq!(decoder.read_int().unwrap(), 5);
        decoder.read_array_end().unwrap();
        decoder.read_record_end().unwrap();
        assert!(decoder.is_at_end());
    }

    #[test]
    fn rejects_wrong_record_marker() {
        let mut decoder = FormatDecoder::new("O:8:\"awbwGame\":0:{}");
        assert!(decoder.read_record_start("awbwUnit").is_err());
    }

    #[test]
    fn reads_line_header() {
        let mut decoder = FormatDecoder::new("p:3;d:12;a:");
        assert_eq!(decoder.read_tagged_int('p').unwrap(), 3);
        assert_eq!(decoder.read_tagged_int('d').unwrap(), 12);
        decoder.expect_literal("a:").unwrap();
    }
}
