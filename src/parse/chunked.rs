use bytes::Bytes;

use crate::channel::BodyChannel;
use crate::error::BodyError;

/// Longest accepted chunk-size line (digits plus extensions).
const MAX_SIZE_LINE: usize = 1024;

/// Verdict of one [`ChunkedBodyParser::feed`] call.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChunkOutcome {
    /// More bytes needed.
    Incomplete,
    /// Terminating chunk and trailers fully consumed.
    Done,
    /// Framing is malformed; the error was fed to the body channel.
    Failed,
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Size { value: u64, digits: usize },
    SizeExt { value: u64, taken: usize },
    SizeLf { value: u64 },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    TrailerFirst,
    TrailerLine,
    EndLf,
    Done,
    Failed,
}

/// Incremental chunked-transfer decoder.
///
/// Decoded data spans are fed to the request's body channel as shared
/// slices of the inbound buffer; framing octets are consumed in place.
#[derive(Debug)]
pub(crate) struct ChunkedBodyParser {
    phase: Phase,
}

impl ChunkedBodyParser {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Size { value: 0, digits: 0 },
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    /// Feed raw wire bytes. Returns the number of octets consumed; on
    /// `Done`, unconsumed octets belong to a pipelined request.
    pub(crate) fn feed(&mut self, buf: &Bytes, chan: &mut BodyChannel) -> (usize, ChunkOutcome) {
        let mut pos = 0;

        macro_rules! fail {
            () => {{
                self.phase = Phase::Failed;
                chan.feed_error(BodyError::InvalidChunked);
                return (pos, ChunkOutcome::Failed);
            }};
        }

        while pos < buf.len() {
            match self.phase {
                Phase::Size { mut value, mut digits } => {
                    loop {
                        let Some(&b) = buf.get(pos) else {
                            self.phase = Phase::Size { value, digits };
                            return (pos, ChunkOutcome::Incomplete);
                        };
                        match b {
                            b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                                if digits >= 16 {
                                    fail!();
                                }
                                value = (value << 4) | u64::from(hex_digit(b));
                                digits += 1;
                                pos += 1;
                            }
                            b';' if digits > 0 => {
                                pos += 1;
                                self.phase = Phase::SizeExt { value, taken: 0 };
                                break;
                            }
                            b'\r' if digits > 0 => {
                                pos += 1;
                                self.phase = Phase::SizeLf { value };
                                break;
                            }
                            b'\n' if digits > 0 => {
                                pos += 1;
                                self.phase = size_parsed(value);
                                break;
                            }
                            _ => fail!(),
                        }
                    }
                }
                Phase::SizeExt { value, taken } => {
                    let span = &buf[pos..];
                    let end = span.iter().position(|&b| b == b'\n');
                    let scanned = end.map_or(span.len(), |i| i + 1);
                    if taken + scanned > MAX_SIZE_LINE {
                        fail!();
                    }
                    pos += scanned;
                    self.phase = match end {
                        Some(_) => size_parsed(value),
                        None => Phase::SizeExt { value, taken: taken + scanned },
                    };
                }
                Phase::SizeLf { value } => {
                    if buf[pos] != b'\n' {
                        fail!();
                    }
                    pos += 1;
                    self.phase = size_parsed(value);
                }
                Phase::Data { remaining } => {
                    let span = &buf[pos..];
                    let taken = span.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    chan.feed(buf.slice(pos..pos + taken));
                    pos += taken;
                    let remaining = remaining - taken as u64;
                    self.phase = if remaining == 0 {
                        Phase::DataCr
                    } else {
                        Phase::Data { remaining }
                    };
                }
                Phase::DataCr => match buf[pos] {
                    b'\r' => {
                        pos += 1;
                        self.phase = Phase::DataLf;
                    }
                    b'\n' => {
                        pos += 1;
                        self.phase = Phase::Size { value: 0, digits: 0 };
                    }
                    _ => fail!(),
                },
                Phase::DataLf => {
                    if buf[pos] != b'\n' {
                        fail!();
                    }
                    pos += 1;
                    self.phase = Phase::Size { value: 0, digits: 0 };
                }
                Phase::TrailerFirst => match buf[pos] {
                    b'\r' => {
                        pos += 1;
                        self.phase = Phase::EndLf;
                    }
                    b'\n' => {
                        pos += 1;
                        self.phase = Phase::Done;
                        return (pos, ChunkOutcome::Done);
                    }
                    _ => self.phase = Phase::TrailerLine,
                },
                Phase::TrailerLine => {
                    let span = &buf[pos..];
                    match span.iter().position(|&b| b == b'\n') {
                        Some(i) => {
                            pos += i + 1;
                            self.phase = Phase::TrailerFirst;
                        }
                        None => {
                            pos += span.len();
                        }
                    }
                }
                Phase::EndLf => {
                    if buf[pos] != b'\n' {
                        fail!();
                    }
                    pos += 1;
                    self.phase = Phase::Done;
                    return (pos, ChunkOutcome::Done);
                }
                Phase::Done => return (pos, ChunkOutcome::Done),
                Phase::Failed => return (pos, ChunkOutcome::Failed),
            }
        }

        (pos, ChunkOutcome::Incomplete)
    }

    /// The socket hit EOF mid-body. Reports `UNEXPECTED_EOF` downstream
    /// unless the terminating chunk was already consumed.
    pub(crate) fn feed_unexpected_eof(&mut self, chan: &mut BodyChannel) {
        if !self.is_done() {
            self.phase = Phase::Failed;
            chan.feed_error(BodyError::UnexpectedEof);
        }
    }
}

fn size_parsed(value: u64) -> Phase {
    if value == 0 {
        Phase::TrailerFirst
    } else {
        Phase::Data { remaining: value }
    }
}

fn hex_digit(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}
