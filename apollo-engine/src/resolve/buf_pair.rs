use bytes::BufMut;
use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::parse_error_objects;
use crate::graphql;
use crate::graphql::Location;
use crate::json_ext::Path;

/// The output of a load: the data written by the data source and zero or more JSON error
/// objects separated by commas.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BufPair {
    pub data: BytesMut,
    pub errors: BytesMut,
}

impl BufPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.errors.clear();
    }

    /// Appends one error object.
    pub fn write_err(&mut self, message: &str, locations: Vec<Location>, path: Option<Path>) {
        let error = graphql::Error::builder()
            .message(message)
            .locations(locations)
            .and_path(path)
            .build();
        self.write_graphql_error(&error)
    }

    /// Appends one error object.
    pub fn write_graphql_error(&mut self, error: &graphql::Error) {
        let start = self.errors.len();
        if start > 0 {
            self.errors.put_u8(b',');
        }
        if let Err(err) = serde_json::to_writer((&mut self.errors).writer(), error) {
            tracing::error!(error = %err, "could not serialize GraphQL error");
            self.errors.truncate(start);
        }
    }

    /// The errors written so far.
    pub(crate) fn graphql_errors(&self) -> Vec<graphql::Error> {
        if self.errors.is_empty() {
            return Vec::new();
        }
        parse_error_objects(&self.errors).unwrap_or_else(|err| {
            tracing::error!(error = %err, "data source wrote malformed errors");
            vec![err.to_graphql_error(None)]
        })
    }

    pub(crate) fn copy_from(&mut self, other: &BufPair) {
        self.data.extend_from_slice(&other.data);
        if other.has_errors() {
            if self.has_errors() {
                self.errors.put_u8(b',');
            }
            self.errors.extend_from_slice(&other.errors);
        }
    }
}

/// Recycles [`BufPair`]s between fetches.
#[derive(Debug)]
pub struct BufPairPool {
    pairs: Mutex<Vec<BufPair>>,
    capacity: usize,
}

impl BufPairPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            pairs: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// An empty pair, recycled when one is available.
    pub fn get(&self) -> BufPair {
        self.pairs.lock().pop().unwrap_or_default()
    }

    /// Resets the pair and keeps it unless the pool is full.
    pub fn put(&self, mut pair: BufPair) {
        pair.reset();
        let mut pairs = self.pairs.lock();
        if pairs.len() < self.capacity {
            pairs.push(pair);
        }
    }

    pub fn idle(&self) -> usize {
        self.pairs.lock().len()
    }
}
