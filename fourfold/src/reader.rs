//! Buffered reader that reads lines forward or backward from any offset.
//!
//! The reader keeps one fixed-size window over the underlying file. A read
//! that falls outside the window triggers a rebuffer: forward reads anchor the
//! new window at the requested byte, backward reads anchor it so that it ends
//! just after the requested byte. A direction change therefore re-anchors the
//! window instead of re-reading consumed bytes twice.
//!
//! The read direction lives in [`Cursor`], a two-state value: there is no
//! separate direction flag that could disagree with the position.
//!
//! Lines end in LF or CRLF. The terminator is stripped once per line; a CR
//! that is not followed by LF is kept as data.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::trace;

use crate::error::{AccessError, FourfoldError, Result};

/// Smallest window the reader will allocate.
const MIN_BUFFER_SIZE: usize = 16;

/// Read position and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// The next line starts at `position`.
    Forward {
        /// Offset of the next byte to read.
        position: u64,
    },
    /// The next line ends at `position` (exclusive, terminator included).
    Backward {
        /// Offset just past the last byte still to read.
        position: u64,
    },
}

impl Cursor {
    /// The byte offset of the cursor, regardless of direction.
    pub fn position(&self) -> u64 {
        match *self {
            Cursor::Forward { position } | Cursor::Backward { position } => position,
        }
    }
}

/// One line read from the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Offset of the first byte of the line.
    pub offset: u64,
    /// Offset just past the line terminator (or end of file).
    pub end: u64,
    /// Line content without its terminator.
    pub text: String,
}

impl Line {
    /// Size of the line on disk, terminator included.
    pub fn byte_len(&self) -> u64 {
        self.end - self.offset
    }
}

/// Buffered bidirectional line reader over a seekable source.
///
/// # Examples
///
/// ```rust
/// use std::io::Cursor as IoCursor;
/// use fourfold::reader::BufferedBidirectionalReader;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let data = IoCursor::new(b"a\nb\nc\n".to_vec());
/// let mut reader = BufferedBidirectionalReader::new(data, "mem", 64)?;
///
/// reader.seek_backward(reader.len());
/// assert_eq!(reader.read_line()?.unwrap().text, "c");
/// assert_eq!(reader.read_line()?.unwrap().text, "b");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BufferedBidirectionalReader<R> {
    inner: R,
    label: String,
    buf: Vec<u8>,
    buffer_offset: u64,
    valid: usize,
    len: u64,
    floor: u64,
    cursor: Cursor,
    rebuffers: u64,
}

impl BufferedBidirectionalReader<File> {
    /// Opens `path` with a window of `buffer_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Io`] if the file cannot be opened or measured.
    pub fn open(path: impl AsRef<Path>, buffer_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let label = path.display().to_string();
        let file = File::open(path).map_err(|source| AccessError::Io {
            path: label.clone(),
            source,
        })?;
        Self::new(file, label, buffer_size)
    }
}

impl<R: Read + Seek> BufferedBidirectionalReader<R> {
    /// Wraps `inner`; `label` names the source in errors.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Io`] if the source length cannot be determined.
    pub fn new(mut inner: R, label: impl Into<String>, buffer_size: usize) -> Result<Self> {
        let label = label.into();
        let len = inner
            .seek(SeekFrom::End(0))
            .map_err(|source| AccessError::Io {
                path: label.clone(),
                source,
            })?;

        Ok(Self {
            inner,
            label,
            buf: vec![0; buffer_size.max(MIN_BUFFER_SIZE)],
            buffer_offset: 0,
            valid: 0,
            len,
            floor: 0,
            cursor: Cursor::Forward { position: 0 },
            rebuffers: 0,
        })
    }

    /// Name of the source used in error messages.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Length of the source in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the source holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current cursor.
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Current byte offset of the cursor.
    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    /// Number of window refills since the reader was created.
    pub fn rebuffer_count(&self) -> u64 {
        self.rebuffers
    }

    /// Sets the lowest offset backward reads may reach (e.g. end of a header).
    pub fn set_floor(&mut self, offset: u64) {
        self.floor = offset.min(self.len);
    }

    /// Positions the cursor to read forward from `offset`.
    pub fn seek_forward(&mut self, offset: u64) {
        self.cursor = Cursor::Forward {
            position: offset.min(self.len),
        };
    }

    /// Positions the cursor to read backward from `offset`.
    pub fn seek_backward(&mut self, offset: u64) {
        self.cursor = Cursor::Backward {
            position: offset.min(self.len),
        };
    }

    /// Moves the cursor forward to the start of the next full line.
    ///
    /// If the cursor already sits at a line start (the floor, or just after a
    /// line feed) it does not move. The cursor is left in forward direction.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    pub fn align_forward(&mut self) -> Result<u64> {
        let position = self.cursor.position().max(self.floor);
        self.cursor = Cursor::Forward { position };
        if position == self.floor || position >= self.len {
            return Ok(position);
        }
        if self.byte_at(position - 1, Anchor::Backward)? == b'\n' {
            return Ok(position);
        }
        self.skip_past_newline(position)
    }

    /// Reads the next line in the cursor's direction.
    ///
    /// Returns `Ok(None)` at end of file (forward) or at the floor (backward).
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Io`] on read failure and
    /// [`AccessError::CorruptRecord`] if the line is not valid UTF-8.
    pub fn read_line(&mut self) -> Result<Option<Line>> {
        match self.cursor {
            Cursor::Forward { position } => self.read_forward(position),
            Cursor::Backward { position } => self.read_backward(position),
        }
    }

    fn read_forward(&mut self, start: u64) -> Result<Option<Line>> {
        if start >= self.len {
            return Ok(None);
        }

        let mut bytes = Vec::new();
        let mut pos = start;
        let mut terminated = false;
        while pos < self.len {
            self.fill(pos, Anchor::Forward)?;
            let window = &self.buf[self.window_index(pos)..self.valid];
            match window.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    bytes.extend_from_slice(&window[..i]);
                    pos += i as u64 + 1;
                    terminated = true;
                    break;
                }
                None => {
                    bytes.extend_from_slice(window);
                    pos += window.len() as u64;
                }
            }
        }
        if terminated && bytes.last() == Some(&b'\r') {
            bytes.pop();
        }

        self.cursor = Cursor::Forward { position: pos };
        self.finish_line(start, pos, bytes).map(Some)
    }

    fn read_backward(&mut self, end: u64) -> Result<Option<Line>> {
        if end <= self.floor {
            return Ok(None);
        }

        let mut content_end = end;
        if self.byte_at(content_end - 1, Anchor::Backward)? == b'\n' {
            content_end -= 1;
            if content_end > self.floor && self.byte_at(content_end - 1, Anchor::Backward)? == b'\r'
            {
                content_end -= 1;
            }
        }

        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut pos = content_end;
        let start = loop {
            if pos <= self.floor {
                break self.floor;
            }
            self.fill(pos - 1, Anchor::Backward)?;
            let low = self.buffer_offset.max(self.floor);
            let window = &self.buf[self.window_index(low)..self.window_index(pos)];
            match window.iter().rposition(|&b| b == b'\n') {
                Some(i) => {
                    chunks.push(window[i + 1..].to_vec());
                    break low + i as u64 + 1;
                }
                None => {
                    chunks.push(window.to_vec());
                    pos = low;
                }
            }
        };

        let bytes: Vec<u8> = chunks.into_iter().rev().flatten().collect();
        self.cursor = Cursor::Backward { position: start };
        self.finish_line(start, end, bytes).map(Some)
    }

    fn skip_past_newline(&mut self, from: u64) -> Result<u64> {
        let mut pos = from;
        while pos < self.len {
            self.fill(pos, Anchor::Forward)?;
            let window = &self.buf[self.window_index(pos)..self.valid];
            if let Some(i) = window.iter().position(|&b| b == b'\n') {
                pos += i as u64 + 1;
                self.cursor = Cursor::Forward { position: pos };
                return Ok(pos);
            }
            pos += window.len() as u64;
        }
        self.cursor = Cursor::Forward { position: self.len };
        Ok(self.len)
    }

    fn finish_line(&self, offset: u64, end: u64, bytes: Vec<u8>) -> Result<Line> {
        let text = String::from_utf8(bytes).map_err(|e| AccessError::CorruptRecord {
            path: self.label.clone(),
            offset,
            reason: format!("line is not valid UTF-8: {e}"),
        })?;
        Ok(Line { offset, end, text })
    }

    fn byte_at(&mut self, pos: u64, anchor: Anchor) -> Result<u8> {
        self.fill(pos, anchor)?;
        Ok(self.buf[self.window_index(pos)])
    }

    #[allow(clippy::cast_possible_truncation)] // pos lies inside the window
    fn window_index(&self, pos: u64) -> usize {
        (pos - self.buffer_offset) as usize
    }

    /// Ensures byte `pos` is inside the window, refilling it if needed.
    fn fill(&mut self, pos: u64, anchor: Anchor) -> Result<()> {
        if pos >= self.buffer_offset && pos < self.buffer_offset + self.valid as u64 {
            return Ok(());
        }

        let capacity = self.buf.len() as u64;
        let start = match anchor {
            Anchor::Forward => pos,
            Anchor::Backward => (pos + 1).saturating_sub(capacity),
        };

        self.inner
            .seek(SeekFrom::Start(start))
            .map_err(|source| self.io_error(source))?;
        let mut filled = 0;
        while filled < self.buf.len() {
            match self.inner.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(source) => return Err(self.io_error(source)),
            }
        }

        self.buffer_offset = start;
        self.valid = filled;
        self.rebuffers += 1;
        trace!(
            source = %self.label,
            offset = start,
            bytes = filled,
            ?anchor,
            "rebuffered reader window"
        );

        if pos >= start + filled as u64 {
            return Err(self.io_error(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("source ended before byte {pos}"),
            )));
        }
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> FourfoldError {
        AccessError::Io {
            path: self.label.clone(),
            source,
        }
        .into()
    }
}

/// Where a refilled window is anchored relative to the missed byte.
#[derive(Debug, Clone, Copy)]
enum Anchor {
    Forward,
    Backward,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor as IoCursor;

    fn reader(data: &str, buffer_size: usize) -> BufferedBidirectionalReader<IoCursor<Vec<u8>>> {
        BufferedBidirectionalReader::new(IoCursor::new(data.as_bytes().to_vec()), "test", buffer_size)
            .unwrap()
    }

    fn drain(r: &mut BufferedBidirectionalReader<IoCursor<Vec<u8>>>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = r.read_line().unwrap() {
            lines.push(line.text);
        }
        lines
    }

    #[test]
    fn test_forward_lines() {
        let mut r = reader("alpha\nbeta\ngamma", 16);
        assert_eq!(drain(&mut r), vec!["alpha", "beta", "gamma"]);
        assert_eq!(r.position(), r.len());
    }

    #[test]
    fn test_backward_lines() {
        let mut r = reader("alpha\nbeta\ngamma\n", 16);
        r.seek_backward(r.len());
        assert_eq!(drain(&mut r), vec!["gamma", "beta", "alpha"]);
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn test_crlf_stripped_once() {
        let mut r = reader("a\r\nb\r\r\nc\r\n", 16);
        assert_eq!(drain(&mut r), vec!["a", "b\r", "c"]);

        r.seek_backward(r.len());
        assert_eq!(drain(&mut r), vec!["c", "b\r", "a"]);
    }

    #[test]
    fn test_lines_longer_than_window() {
        let long = "x".repeat(100);
        let data = format!("{long}\nshort\n{long}\n");
        let mut r = reader(&data, 16);
        assert_eq!(drain(&mut r), vec![long.as_str(), "short", long.as_str()]);

        r.seek_backward(r.len());
        assert_eq!(drain(&mut r), vec![long.as_str(), "short", long.as_str()]);
        assert!(r.rebuffer_count() > 6);
    }

    #[test]
    fn test_line_offsets() {
        let mut r = reader("ab\ncde\nf\n", 16);
        r.seek_forward(3);
        let line = r.read_line().unwrap().unwrap();
        assert_eq!((line.offset, line.end, line.text.as_str()), (3, 7, "cde"));
        assert_eq!(line.byte_len(), 4);

        r.seek_backward(7);
        let line = r.read_line().unwrap().unwrap();
        assert_eq!((line.offset, line.end), (3, 7));
        assert_eq!(r.cursor(), Cursor::Backward { position: 3 });
    }

    #[test]
    fn test_floor_stops_backward_reads() {
        let mut r = reader("time,v\n1,2\n3,4\n", 16);
        r.set_floor(7);
        r.seek_backward(r.len());
        assert_eq!(drain(&mut r), vec!["3,4", "1,2"]);
    }

    #[test]
    fn test_align_forward() {
        let mut r = reader("head\n100,1\n200,2\n", 16);
        r.set_floor(5);

        r.seek_forward(7);
        assert_eq!(r.align_forward().unwrap(), 11);
        assert_eq!(r.read_line().unwrap().unwrap().text, "200,2");

        // Already on a line start.
        r.seek_forward(11);
        assert_eq!(r.align_forward().unwrap(), 11);

        // Below the floor snaps to the floor.
        r.seek_forward(0);
        assert_eq!(r.align_forward().unwrap(), 5);
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        let bytes = vec![b'o', b'k', b'\n', 0xff, 0xfe, b'\n'];
        let mut r = BufferedBidirectionalReader::new(IoCursor::new(bytes), "bin", 16).unwrap();
        assert_eq!(r.read_line().unwrap().unwrap().text, "ok");
        let err = r.read_line().unwrap_err();
        assert!(matches!(
            err,
            FourfoldError::Access(AccessError::CorruptRecord { offset: 3, .. })
        ));
    }

    #[test]
    fn test_empty_source() {
        let mut r = reader("", 16);
        assert!(r.is_empty());
        assert!(r.read_line().unwrap().is_none());
        r.seek_backward(0);
        assert!(r.read_line().unwrap().is_none());
    }
}
