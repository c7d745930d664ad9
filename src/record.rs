//! A named, ordered, cursor-bearing sequence of request/response exchanges.

use serde::{Deserialize, Serialize};

use crate::mock::{MockRequest, MockResponse};
use crate::{PlayerError, Result};

/// A single captured (request, response) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub request: MockRequest,
    pub response: MockResponse,
}

/// An ordered sequence of Exchanges plus a read cursor.
///
/// A Record has no awareness of HTTP or JSON; it is a cursor over opaque
/// Exchange values. Replay pops exchanges in recorded order; recording
/// appends in reception order.
#[derive(Debug, Clone, Default)]
pub struct Record {
    name: String,
    exchanges: Vec<Exchange>,
    index: usize,
}

impl Record {
    /// Create a fresh, empty Record with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exchanges: Vec::new(),
            index: 0,
        }
    }

    /// Reconstruct a Record from previously-persisted exchanges, cursor at 0.
    #[must_use]
    pub fn from_exchanges(name: impl Into<String>, exchanges: Vec<Exchange>) -> Self {
        Self {
            name: name.into(),
            exchanges,
            index: 0,
        }
    }

    /// The record's name, unique within its owning Cassette.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The exchanges captured so far, in recorded order.
    #[must_use]
    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// Number of exchanges in the Record.
    #[must_use]
    pub fn length(&self) -> usize {
        self.exchanges.len()
    }

    /// Current cursor position.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Return the Exchange at the cursor and advance it.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::EndOfRecord`] if the cursor is at or past the
    /// end of the Record.
    pub fn read(&mut self) -> Result<&Exchange> {
        if self.index >= self.exchanges.len() {
            return Err(PlayerError::EndOfRecord);
        }
        let exchange = &self.exchanges[self.index];
        self.index += 1;
        Ok(exchange)
    }

    /// Append an Exchange to the tail and advance the cursor. Used only
    /// while recording.
    pub fn write(&mut self, exchange: Exchange) {
        self.exchanges.push(exchange);
        self.index = self.exchanges.len();
    }

    /// Reset the cursor to 0.
    pub fn rewind(&mut self) {
        self.index = 0;
    }
}
