use std::fmt;

use crate::lstr::LStr;

const MAX_HEADERS: usize = 128;

/// Ordered header multimap.
///
/// Names are stored lowercased by the tokenizer; lookups are ASCII
/// case-insensitive. Iteration preserves insertion order. Repeated names
/// are kept as separate entries ([`get`] returns the first,
/// [`get_all`] all of them).
///
/// [`get`]: HeaderMap::get
/// [`get_all`]: HeaderMap::get_all
#[derive(Default)]
pub struct HeaderMap {
    entries: Vec<Entry>,
}

#[derive(Debug)]
pub struct Entry {
    pub name: LStr,
    pub value: LStr,
}

impl HeaderMap {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry. Returns `false` once the table is full.
    pub fn append(&mut self, name: LStr, value: LStr) -> bool {
        if self.entries.len() >= MAX_HEADERS {
            return false;
        }
        self.entries.push(Entry { name, value });
        true
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &[u8]) -> Option<&LStr> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_case(name))
            .map(|e| &e.value)
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a [u8]) -> impl Iterator<Item = &'a LStr> {
        self.entries
            .iter()
            .filter(move |e| e.name.eq_ignore_case(name))
            .map(|e| &e.value)
    }

    pub fn contains_key(&self, name: &[u8]) -> bool {
        self.get(name).is_some()
    }

    /// All entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Drop all entries, keeping the table's capacity for reuse.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Debug for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for entry in &self.entries {
            map.entry(&entry.name, &entry.value);
        }
        map.finish()
    }
}
