//! The pluggable tokenizers driving header and chunked-body parsing.
//!
//! Both are incremental state machines fed whatever the socket produced;
//! they never block and never buffer more than the current partial token.
//! Header parser states are large (they carry reusable scratch buffers) and
//! live only for the header phase of one request, so they are checked out
//! of a per-server [`ObjectPool`] and return to it on drop.

mod chunked;
mod headers;

#[cfg(test)]
mod test;

use std::rc::Rc;

use crate::pool::{ObjectPool, Pooled};

pub(crate) use chunked::{ChunkOutcome, ChunkedBodyParser};
pub(crate) use headers::{HeadOutcome, HeaderParserState};

/// Initial and retained sizes of the per-server header-state pool.
const POOL_INITIAL: usize = 16;
const POOL_HIGH_WATER: usize = 256;

pub(crate) type HeaderStatePool = ObjectPool<HeaderParserState>;

pub(crate) fn new_header_state_pool() -> Rc<HeaderStatePool> {
    ObjectPool::new(POOL_INITIAL, POOL_HIGH_WATER)
}

/// Which tokenizer, if any, a request currently owns.
///
/// The pooled header state goes back to its pool when this is overwritten
/// or dropped; the chunked state is owned inline.
#[derive(Default)]
pub(crate) enum ParserState {
    #[default]
    None,
    Headers(Pooled<HeaderParserState>),
    Chunked(ChunkedBodyParser),
}

impl ParserState {
    pub(crate) fn take(&mut self) -> ParserState {
        std::mem::take(self)
    }
}
