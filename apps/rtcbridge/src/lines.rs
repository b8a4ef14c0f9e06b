// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded line reader for the request stream.
//!
//! Reads raw bytes up to each `\n` and never holds more than the configured
//! limit: the rest of an oversized line is skipped as it arrives. Decoding
//! happens per line, so one bad line does not end the stream.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// One input line, without its terminator.
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    Text(String),
    /// The line exceeded the limit; carries its full length in bytes.
    TooLong(usize),
    NotUtf8,
}

pub struct LineReader<R> {
    input: R,
    max_line_bytes: usize,
    buf: Vec<u8>,
    /// Bytes of the current line seen past the limit, counting what was
    /// buffered before it was exceeded.
    overflow: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub const fn new(input: R, max_line_bytes: usize) -> Self {
        Self { input, max_line_bytes, buf: Vec::new(), overflow: 0 }
    }

    /// Reads the next line, or `None` at end of input. A final line without
    /// a terminator is still returned.
    ///
    /// Cancel safe: progress on a partial line is kept in the reader.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying read.
    pub async fn next_line(&mut self) -> io::Result<Option<Line>> {
        loop {
            let available = self.input.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() && self.overflow == 0 {
                    return Ok(None);
                }
                return Ok(Some(self.take()));
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            if self.overflow == 0 && self.buf.len() + chunk.len() <= self.max_line_bytes {
                self.buf.extend_from_slice(chunk);
            } else {
                self.overflow += self.buf.len() + chunk.len();
                self.buf.clear();
            }
            let consumed = chunk.len() + usize::from(newline.is_some());
            self.input.consume(consumed);
            if newline.is_some() {
                return Ok(Some(self.take()));
            }
        }
    }

    /// Ends the current line. The buffer is kept for the next one.
    fn take(&mut self) -> Line {
        let overflow = std::mem::take(&mut self.overflow);
        if overflow > 0 {
            return Line::TooLong(overflow);
        }
        let bytes = self.buf.strip_suffix(b"\r").unwrap_or(&self.buf[..]);
        let line = std::str::from_utf8(bytes).map_or(Line::NotUtf8, |s| Line::Text(s.to_owned()));
        self.buf.clear();
        line
    }

    /// High-water mark of the line buffer.
    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buf.capacity()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::BufReader;

    use super::*;

    async fn read_all(input: &[u8], max: usize) -> Vec<Line> {
        let mut reader = LineReader::new(BufReader::with_capacity(8, input), max);
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn splits_lines_and_strips_terminators() {
        let lines = read_all(b"first\r\nsecond\n\nlast", 64).await;
        assert_eq!(
            lines,
            [
                Line::Text("first".into()),
                Line::Text("second".into()),
                Line::Text(String::new()),
                Line::Text("last".into()),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_spoils_only_its_own_line() {
        let lines = read_all(b"\xff\xfe garbage\n{\"ok\":1}\n", 64).await;
        assert_eq!(lines, [Line::NotUtf8, Line::Text(r#"{"ok":1}"#.into())]);
    }

    #[tokio::test]
    async fn oversized_lines_are_skipped_without_buffering() {
        let mut input = vec![b'x'; 10_000];
        input.extend_from_slice(b"\nshort\n");
        let mut reader = LineReader::new(BufReader::with_capacity(8, input.as_slice()), 16);

        assert_eq!(reader.next_line().await.unwrap(), Some(Line::TooLong(10_000)));
        assert!(reader.buffered() <= 16, "held {} bytes", reader.buffered());
        assert_eq!(reader.next_line().await.unwrap(), Some(Line::Text("short".into())));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn limit_is_inclusive() {
        let lines = read_all(b"12345678\n123456789\n", 8).await;
        assert_eq!(lines, [Line::Text("12345678".into()), Line::TooLong(9)]);
    }
}
