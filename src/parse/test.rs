use bytes::Bytes;

use super::chunked::{ChunkOutcome, ChunkedBodyParser};
use super::headers::{HeadOutcome, HeaderParserState};
use crate::arena::RequestArena;
use crate::channel::{BodyChannel, BodyFrame};
use crate::error::{BodyError, ParseError};
use crate::method::Method;
use crate::request::{BodyType, Request};

fn fresh_request() -> Request {
    let mut req = Request::new();
    req.pool = Some(RequestArena::new());
    req
}

fn parse(input: &[u8]) -> (Request, usize, HeadOutcome) {
    let mut req = fresh_request();
    let mut state = HeaderParserState::default();
    let (consumed, outcome) = state.feed(&mut req, &Bytes::copy_from_slice(input));
    (req, consumed, outcome)
}

/// Same head, delivered one octet at a time.
fn parse_dribbled(input: &[u8]) -> (Request, HeadOutcome) {
    let mut req = fresh_request();
    let mut state = HeaderParserState::default();
    for (i, &b) in input.iter().enumerate() {
        let (consumed, outcome) = state.feed(&mut req, &Bytes::copy_from_slice(&[b]));
        match outcome {
            HeadOutcome::Incomplete => assert_eq!(consumed, 1),
            done => {
                assert_eq!(i, input.len() - 1, "finished early at octet {i}");
                return (req, done);
            }
        }
    }
    (req, HeadOutcome::Incomplete)
}

#[test]
fn test_simple_get() {
    let (req, consumed, outcome) = parse(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(matches!(outcome, HeadOutcome::Done));
    assert_eq!(consumed, 37);
    assert_eq!(req.method, Method::GET);
    assert_eq!(req.path.flatten(), b"/index.html");
    assert_eq!((req.http_major, req.http_minor), (1, 1));
    assert_eq!(req.body_type(), BodyType::None);
    assert!(req.want_keep_alive());
    assert_eq!(req.headers.get(b"host").unwrap().flatten(), b"x");
}

#[test]
fn test_dribbled_equals_whole() {
    let input = b"POST /submit HTTP/1.1\r\nHost: api.example\r\nContent-Length: 5\r\n\r\n";
    let (req, outcome) = parse_dribbled(input);
    assert!(matches!(outcome, HeadOutcome::Done));
    assert_eq!(req.method, Method::POST);
    assert_eq!(req.path.flatten(), b"/submit");
    assert_eq!(req.body_type(), BodyType::ContentLength);
    assert_eq!(req.content_length(), Some(5));
    // the path crossed many feed boundaries and stayed scattered
    assert!(req.path.parts().count() > 1);
}

#[test]
fn test_done_leaves_body_bytes() {
    let (_, consumed, outcome) = parse(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
    assert!(matches!(outcome, HeadOutcome::Done));
    // "hello" is not part of the head
    assert_eq!(consumed, 38);
}

#[test]
fn test_http_10_defaults_to_close() {
    let (req, _, outcome) = parse(b"GET / HTTP/1.0\r\n\r\n");
    assert!(matches!(outcome, HeadOutcome::Done));
    assert!(!req.want_keep_alive());

    let (req, _, _) = parse(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
    assert!(req.want_keep_alive());
}

#[test]
fn test_connection_close() {
    let (req, _, _) = parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(!req.want_keep_alive());
}

#[test]
fn test_chunked_body_mode() {
    let (req, _, outcome) = parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
    assert!(matches!(outcome, HeadOutcome::Done));
    assert_eq!(req.body_type(), BodyType::Chunked);
    assert!(!req.end_chunk_reached());
}

#[test]
fn test_upgrade_mode() {
    let (req, _, _) = parse(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: upgrade\r\n\r\n");
    assert_eq!(req.body_type(), BodyType::Upgrade);
}

#[test]
fn test_secure_header_routing() {
    let (req, _, outcome) = parse(b"GET / HTTP/1.1\r\n!~Passenger-Env: prod\r\nHost: x\r\n\r\n");
    assert!(matches!(outcome, HeadOutcome::Done));
    assert!(req.headers.get(b"!~passenger-env").is_none());
    assert!(req.headers.get(b"passenger-env").is_none());
    assert_eq!(
        req.secure_headers.get(b"passenger-env").unwrap().flatten(),
        b"prod"
    );
}

#[test]
fn test_value_whitespace_trimmed() {
    let (req, _, _) = parse(b"GET / HTTP/1.1\r\nHost:   spaced.example   \r\n\r\n");
    assert_eq!(req.headers.get(b"host").unwrap().flatten(), b"spaced.example");
}

#[test]
fn test_interior_whitespace_kept() {
    let (req, _, _) = parse(b"GET / HTTP/1.1\r\nUser-Agent: curl 8.0 (x86)\r\n\r\n");
    assert_eq!(
        req.headers.get(b"user-agent").unwrap().flatten(),
        b"curl 8.0 (x86)"
    );
}

#[test]
fn test_unknown_method() {
    let (_, _, outcome) = parse(b"NOTAVERB / XYZ\r\n\r\n");
    match outcome {
        HeadOutcome::Failed(err) => assert_eq!(err, ParseError::UnknownMethod),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn test_unsupported_version() {
    let (_, _, outcome) = parse(b"GET / HTTP/2.0\r\n\r\n");
    match outcome {
        HeadOutcome::Failed(err) => assert_eq!(err, ParseError::VersionNotSupported),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn test_garbage_version() {
    let (_, _, outcome) = parse(b"GET / XYZ\r\n\r\n");
    assert!(matches!(
        outcome,
        HeadOutcome::Failed(ParseError::InvalidRequestLine)
    ));
}

#[test]
fn test_conflicting_framing() {
    let (_, _, outcome) = parse(
        b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n",
    );
    assert!(matches!(
        outcome,
        HeadOutcome::Failed(ParseError::InvalidTransferEncoding)
    ));
}

#[test]
fn test_duplicate_content_length() {
    let (_, _, outcome) = parse(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n");
    assert!(matches!(
        outcome,
        HeadOutcome::Failed(ParseError::InvalidContentLength)
    ));
}

#[test]
fn test_bad_content_length() {
    let (_, _, outcome) = parse(b"POST / HTTP/1.1\r\nContent-Length: 3x\r\n\r\n");
    assert!(matches!(
        outcome,
        HeadOutcome::Failed(ParseError::InvalidContentLength)
    ));
}

// ===== Chunked =====

fn drain_data(chan: &mut BodyChannel) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(frame) = chan.pop() {
        match frame {
            BodyFrame::Data(d) => out.extend_from_slice(&d),
            BodyFrame::Eof => break,
            BodyFrame::Error(err) => panic!("unexpected body error: {err}"),
        }
    }
    out
}

#[test]
fn test_chunked_decode() {
    let mut parser = ChunkedBodyParser::new();
    let mut chan = BodyChannel::new();
    let wire = Bytes::from_static(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
    let (consumed, outcome) = parser.feed(&wire, &mut chan);
    assert_eq!(outcome, ChunkOutcome::Done);
    assert_eq!(consumed, wire.len());
    assert!(parser.is_done());
    assert_eq!(drain_data(&mut chan), b"hello world");
}

#[test]
fn test_chunked_decode_dribbled() {
    let mut parser = ChunkedBodyParser::new();
    let mut chan = BodyChannel::new();
    let wire = b"a\r\n0123456789\r\n0\r\n\r\n";
    for &b in wire.iter() {
        let (_, outcome) = parser.feed(&Bytes::copy_from_slice(&[b]), &mut chan);
        assert_ne!(outcome, ChunkOutcome::Failed);
    }
    assert!(parser.is_done());
    assert_eq!(drain_data(&mut chan), b"0123456789");
}

#[test]
fn test_chunked_extension_and_trailers() {
    let mut parser = ChunkedBodyParser::new();
    let mut chan = BodyChannel::new();
    let wire = Bytes::from_static(b"3;note=x\r\nabc\r\n0\r\nExpires: never\r\n\r\n");
    let (consumed, outcome) = parser.feed(&wire, &mut chan);
    assert_eq!(outcome, ChunkOutcome::Done);
    assert_eq!(consumed, wire.len());
    assert_eq!(drain_data(&mut chan), b"abc");
}

#[test]
fn test_chunked_done_leaves_pipelined_bytes() {
    let mut parser = ChunkedBodyParser::new();
    let mut chan = BodyChannel::new();
    let wire = Bytes::from_static(b"0\r\n\r\nGET / HTTP/1.1\r\n");
    let (consumed, outcome) = parser.feed(&wire, &mut chan);
    assert_eq!(outcome, ChunkOutcome::Done);
    assert_eq!(consumed, 5);
}

#[test]
fn test_chunked_bad_framing() {
    let mut parser = ChunkedBodyParser::new();
    let mut chan = BodyChannel::new();
    let (_, outcome) = parser.feed(&Bytes::from_static(b"zz\r\n"), &mut chan);
    assert_eq!(outcome, ChunkOutcome::Failed);
    assert!(matches!(
        chan.pop(),
        Some(BodyFrame::Error(BodyError::InvalidChunked))
    ));
}

#[test]
fn test_chunked_unexpected_eof() {
    let mut parser = ChunkedBodyParser::new();
    let mut chan = BodyChannel::new();
    let (_, outcome) = parser.feed(&Bytes::from_static(b"5\r\nhe"), &mut chan);
    assert_eq!(outcome, ChunkOutcome::Incomplete);
    parser.feed_unexpected_eof(&mut chan);
    // the partial chunk data was still delivered, then the error
    assert!(matches!(chan.pop(), Some(BodyFrame::Data(d)) if &d[..] == b"he"));
    assert!(matches!(
        chan.pop(),
        Some(BodyFrame::Error(BodyError::UnexpectedEof))
    ));
}

#[test]
fn test_chunked_eof_after_done_is_clean() {
    let mut parser = ChunkedBodyParser::new();
    let mut chan = BodyChannel::new();
    parser.feed(&Bytes::from_static(b"0\r\n\r\n"), &mut chan);
    parser.feed_unexpected_eof(&mut chan);
    assert!(chan.pop().is_none());
}
