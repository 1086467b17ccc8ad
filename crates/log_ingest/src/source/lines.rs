use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE_BYTES: usize = 8192;

/// One physical line, capped at `max_line_bytes`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct BoundedLine {
    pub(crate) line_number: usize,
    /// At most `max_line_bytes` bytes; the newline is not included.
    pub(crate) bytes: Vec<u8>,
    /// Length of the physical line before capping.
    pub(crate) observed_bytes: usize,
    pub(crate) truncated: bool,
}

impl BoundedLine {
    /// Lossy UTF-8 decode with a trailing `\r` removed and whitespace trimmed.
    pub(crate) fn text(&self) -> String {
        let text = String::from_utf8_lossy(&self.bytes);
        text.trim_end_matches('\r').trim().to_string()
    }
}

/// Splits an async byte stream into newline-delimited lines without ever
/// buffering more than `max_line_bytes` of a single line. Longer lines keep
/// their prefix and the remainder is skipped up to the next newline.
pub(crate) struct BoundedLineReader<R> {
    reader: R,
    max_line_bytes: usize,
    buffer: Box<[u8; CHUNK_SIZE_BYTES]>,
    buffer_pos: usize,
    buffer_len: usize,
    current_line: Vec<u8>,
    observed_bytes: usize,
    line_number: usize,
    done: bool,
}

impl<R: AsyncRead + Unpin> BoundedLineReader<R> {
    pub(crate) fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            max_line_bytes,
            buffer: Box::new([0u8; CHUNK_SIZE_BYTES]),
            buffer_pos: 0,
            buffer_len: 0,
            current_line: Vec::new(),
            observed_bytes: 0,
            line_number: 0,
            done: false,
        }
    }

    /// Next line, or `None` at end of stream. A final line without a
    /// trailing newline is still returned.
    pub(crate) async fn next_line(&mut self) -> io::Result<Option<BoundedLine>> {
        if self.done {
            return Ok(None);
        }

        loop {
            if self.buffer_pos >= self.buffer_len {
                self.buffer_pos = 0;
                self.buffer_len = self.reader.read(&mut self.buffer[..]).await?;
                if self.buffer_len == 0 {
                    self.done = true;
                    if self.observed_bytes > 0 {
                        return Ok(Some(self.finish_line()));
                    }
                    return Ok(None);
                }
            }

            let slice = &self.buffer[self.buffer_pos..self.buffer_len];
            match slice.iter().position(|b| *b == b'\n') {
                Some(newline_idx) => {
                    self.take(newline_idx);
                    self.buffer_pos += newline_idx + 1;
                    return Ok(Some(self.finish_line()));
                }
                None => {
                    let len = slice.len();
                    self.take(len);
                    self.buffer_pos = self.buffer_len;
                }
            }
        }
    }

    fn take(&mut self, len: usize) {
        let room = self.max_line_bytes.saturating_sub(self.current_line.len());
        let keep = room.min(len);
        self.current_line
            .extend_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + keep]);
        self.observed_bytes = self.observed_bytes.saturating_add(len);
    }

    fn finish_line(&mut self) -> BoundedLine {
        self.line_number += 1;
        let observed_bytes = std::mem::take(&mut self.observed_bytes);
        BoundedLine {
            line_number: self.line_number,
            bytes: std::mem::take(&mut self.current_line),
            observed_bytes,
            truncated: observed_bytes > self.max_line_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(bytes: &[u8], max_line_bytes: usize) -> Vec<BoundedLine> {
        let mut reader = BoundedLineReader::new(bytes, max_line_bytes);
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn oversized_line_keeps_prefix_and_iteration_continues() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"ok\n");
        bytes.extend_from_slice(&vec![b'a'; 50]);
        bytes.extend_from_slice(b"\nnext\n");

        let lines = collect(&bytes, 16).await;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].text(), "ok");
        assert!(!lines[0].truncated);
        assert_eq!(lines[1].bytes, vec![b'a'; 16]);
        assert_eq!(lines[1].observed_bytes, 50);
        assert!(lines[1].truncated);
        assert_eq!(lines[2].text(), "next");
        assert_eq!(lines[2].line_number, 3);
    }

    #[tokio::test]
    async fn lines_spanning_chunks_are_reassembled() {
        let long = "x".repeat(CHUNK_SIZE_BYTES * 2 + 17);
        let input = format!("{long}\nshort");
        let lines = collect(input.as_bytes(), CHUNK_SIZE_BYTES * 4).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text(), long);
        assert_eq!(lines[1].text(), "short");
    }

    #[tokio::test]
    async fn blank_lines_and_crlf_are_preserved_as_lines() {
        let lines = collect(b"a\r\n\r\n  \nb", 64).await;
        let texts: Vec<_> = lines.iter().map(BoundedLine::text).collect();
        assert_eq!(texts, vec!["a", "", "", "b"]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let lines = collect(b"caf\xff\n", 64).await;
        assert_eq!(lines[0].text(), "caf\u{fffd}");
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        assert!(collect(b"", 64).await.is_empty());
    }
}
