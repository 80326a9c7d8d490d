//! Generation tokens for asynchronous handles.
//!
//! Every handle a worker opens (control socket, data socket, timer, disk
//! request) is issued a fresh [`Epoch`]. Completions are tagged with the epoch
//! of the handle that produced them; the worker only accepts a completion
//! whose epoch matches the slot it is currently waiting on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed generation token. Issued values are strictly increasing per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Epoch(u64);

impl Epoch {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Issues epochs for one worker.
#[derive(Debug, Default)]
pub struct EpochSource {
    last: u64,
}

impl EpochSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self) -> Epoch {
        self.last += 1;
        Epoch(self.last)
    }
}

/// A slot that holds the epoch of the single live handle of some kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EpochSlot(Option<Epoch>);

impl EpochSlot {
    pub fn set(&mut self, epoch: Epoch) {
        self.0 = Some(epoch);
    }

    /// Forget the live handle; later completions for it become stale.
    pub fn clear(&mut self) -> Option<Epoch> {
        self.0.take()
    }

    pub fn get(&self) -> Option<Epoch> {
        self.0
    }

    pub fn is_live(&self) -> bool {
        self.0.is_some()
    }

    pub fn matches(&self, epoch: Epoch) -> bool {
        self.0 == Some(epoch)
    }
}
