use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

// Hard ceilings on parsed header values so corrupt bytes cannot drive huge
// allocations before the framing error surfaces.
const MAX_ARGS_PER_COMMAND: usize = 1024 * 1024;
const MAX_ARG_LEN: usize = 512 * 1024 * 1024;

/// Error that occurred while reading the textual command framing.
#[derive(Debug, Snafu)]
pub enum FramingError {
    /// A general I/O error occurred.
    #[snafu(display("framing I/O error: {}", source))]
    Io { source: io::Error },

    /// The framing itself is invalid: wrong prefix byte, unparsable length,
    /// missing CRLF terminator, and so on.
    #[snafu(display("malformed command framing: {}", reason))]
    Malformed { reason: String },

    /// The stream ended inside a command.
    #[snafu(display("unexpected end of file inside a command"))]
    Truncated,
}

/// One unit read from a segment.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// A complete command's argument vector.
    Command(Vec<Bytes>),
    /// A `#`-prefixed annotation line, skipped during replay.
    Annotation,
    /// Clean end of the stream, on a command boundary.
    Eof,
}

/// Appends the framing for one command: `*<argc>\r\n` followed by
/// `$<len>\r\n<bytes>\r\n` per argument.
pub(crate) fn encode_command<A: AsRef<[u8]>>(buf: &mut BytesMut, args: &[A]) {
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

pub(crate) fn encode_select(buf: &mut BytesMut, db: u32) {
    let db = db.to_string();
    encode_command(buf, &[b"SELECT".as_slice(), db.as_bytes()]);
}

/// Appends a `#TS:<epoch>\r\n` annotation line.
pub(crate) fn encode_ts_annotation(buf: &mut BytesMut, unix_sec: i64) {
    buf.extend_from_slice(format!("#TS:{unix_sec}\r\n").as_bytes());
}

/// Incremental reader over the textual command framing.
///
/// Tracks the exact number of bytes consumed so the caller can record the
/// offset of the last complete command and truncate a damaged tail back to
/// that boundary.
pub(crate) struct CommandReader<R> {
    reader: BufReader<R>,
    pos: u64,
    line: Vec<u8>,
}

impl<R> CommandReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, reader),
            pos: 0,
            line: Vec::new(),
        }
    }

    /// Bytes consumed from the underlying reader so far. After a `Command`
    /// or `Annotation` outcome this is a valid truncation boundary.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Reads the next command or annotation.
    ///
    /// # Errors
    ///
    /// `Truncated` when the stream ends inside a command, `Malformed` when
    /// the bytes do not form valid framing, `Io` otherwise.
    pub async fn next(&mut self) -> Result<ReadOutcome, FramingError> {
        self.line.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.line)
            .await
            .context(IoSnafu)?;
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        self.pos += n as u64;

        if self.line[0] == b'#' {
            if !self.line.ends_with(b"\n") {
                return Err(FramingError::Truncated);
            }
            return Ok(ReadOutcome::Annotation);
        }

        let header = strip_crlf(&self.line)?;
        if header.first() != Some(&b'*') {
            return Err(FramingError::Malformed {
                reason: format!(
                    "expected '*' at start of command, found {:?}",
                    self.line.first().map(|b| *b as char)
                ),
            });
        }
        let argc = parse_len(&header[1..], "argument count")?;
        if argc == 0 || argc > MAX_ARGS_PER_COMMAND {
            return Err(FramingError::Malformed {
                reason: format!("argument count {argc} out of range"),
            });
        }

        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            self.line.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.line)
                .await
                .context(IoSnafu)?;
            if n == 0 {
                return Err(FramingError::Truncated);
            }
            self.pos += n as u64;

            let header = strip_crlf(&self.line)?;
            if header.first() != Some(&b'$') {
                return Err(FramingError::Malformed {
                    reason: "expected '$' at start of bulk length".to_string(),
                });
            }
            let len = parse_len(&header[1..], "bulk length")?;
            if len > MAX_ARG_LEN {
                return Err(FramingError::Malformed {
                    reason: format!("bulk length {len} out of range"),
                });
            }

            let mut payload = vec![0u8; len + 2];
            match self.reader.read_exact(&mut payload).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(FramingError::Truncated)
                }
                Err(e) => return Err(FramingError::Io { source: e }),
            }
            self.pos += (len + 2) as u64;

            if &payload[len..] != b"\r\n" {
                return Err(FramingError::Malformed {
                    reason: "bulk payload not terminated by CRLF".to_string(),
                });
            }
            payload.truncate(len);
            args.push(Bytes::from(payload));
        }

        Ok(ReadOutcome::Command(args))
    }
}

/// Returns the line with its CRLF terminator removed. A line that reached
/// EOF without a newline is a truncation; a newline without the preceding
/// carriage return is malformed.
fn strip_crlf(line: &[u8]) -> Result<&[u8], FramingError> {
    if !line.ends_with(b"\n") {
        return Err(FramingError::Truncated);
    }
    line.strip_suffix(b"\r\n").ok_or_else(|| FramingError::Malformed {
        reason: "line not terminated by CRLF".to_string(),
    })
}

fn parse_len(digits: &[u8], what: &str) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(digits).map_err(|_| FramingError::Malformed {
        reason: format!("{what} is not ASCII"),
    })?;
    text.parse::<usize>().map_err(|_| FramingError::Malformed {
        reason: format!("invalid {what} '{text}'"),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn args(items: &[&str]) -> Vec<Bytes> {
        items
            .iter()
            .map(|s| Bytes::copy_from_slice(s.as_bytes()))
            .collect()
    }

    #[test]
    fn encode_command_framing() {
        let mut buf = BytesMut::new();
        encode_command(&mut buf, &args(&["SET", "k", "v"]));
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn encode_select_framing() {
        let mut buf = BytesMut::new();
        encode_select(&mut buf, 5);
        assert_eq!(&buf[..], b"*2\r\n$6\r\nSELECT\r\n$1\r\n5\r\n");
    }

    #[test]
    fn encode_annotation_framing() {
        let mut buf = BytesMut::new();
        encode_ts_annotation(&mut buf, 1700000000);
        assert_eq!(&buf[..], b"#TS:1700000000\r\n");
    }

    #[tokio::test]
    async fn reads_back_encoded_commands() {
        let mut buf = BytesMut::new();
        encode_ts_annotation(&mut buf, 42);
        encode_command(&mut buf, &args(&["SET", "k", "v"]));
        encode_command(&mut buf, &args(&["RPUSH", "l", "a", "b"]));

        let mut reader = CommandReader::new(Cursor::new(buf.to_vec()));
        assert!(matches!(
            reader.next().await.unwrap(),
            ReadOutcome::Annotation
        ));
        match reader.next().await.unwrap() {
            ReadOutcome::Command(argv) => assert_eq!(argv, args(&["SET", "k", "v"])),
            other => panic!("unexpected outcome: {other:?}"),
        }
        match reader.next().await.unwrap() {
            ReadOutcome::Command(argv) => assert_eq!(argv, args(&["RPUSH", "l", "a", "b"])),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(reader.next().await.unwrap(), ReadOutcome::Eof));
        assert_eq!(reader.pos(), buf.len() as u64);
    }

    #[tokio::test]
    async fn detects_truncated_command() {
        let mut buf = BytesMut::new();
        encode_command(&mut buf, &args(&["SET", "k", "v"]));
        let valid_len = buf.len();
        encode_command(&mut buf, &args(&["SET", "k", "longer-value"]));
        let bytes = &buf[..buf.len() - 5];

        let mut reader = CommandReader::new(Cursor::new(bytes.to_vec()));
        assert!(matches!(
            reader.next().await.unwrap(),
            ReadOutcome::Command(_)
        ));
        assert_eq!(reader.pos(), valid_len as u64);
        assert!(matches!(reader.next().await, Err(FramingError::Truncated)));
    }

    #[tokio::test]
    async fn detects_malformed_header() {
        let mut reader = CommandReader::new(Cursor::new(b"xyz\r\n".to_vec()));
        assert!(matches!(
            reader.next().await,
            Err(FramingError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn detects_missing_carriage_return() {
        let mut reader = CommandReader::new(Cursor::new(b"*1\n$1\r\nx\r\n".to_vec()));
        assert!(matches!(
            reader.next().await,
            Err(FramingError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_absurd_argument_counts() {
        let mut reader =
            CommandReader::new(Cursor::new(b"*99999999999\r\n".to_vec()));
        assert!(matches!(
            reader.next().await,
            Err(FramingError::Malformed { .. })
        ));
    }
}
