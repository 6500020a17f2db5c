//! Fid number lifecycle.
//!
//! A fid number moves through `Allocated -> Active -> Retiring` and becomes
//! reusable only when the server acknowledges its clunk. The free list is
//! filled in exactly two places: [`FidPool::confirm_retire`], and
//! [`FidPool::release_unused`] for numbers the server never saw established.

use std::collections::HashMap;
use std::fmt;

use log::debug;
use parking_lot::Mutex;

use crate::error::Error;
use crate::fcall::{NOFID, QId};
use crate::utils::Result;

/// Client side liveness of a fid number.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FidState {
    /// Reserved by the client; the establishing request may be in flight.
    Allocated,
    /// The server acknowledged attach/walk and returned this qid.
    Active(QId),
    /// A clunk was sent and its reply has not arrived yet.
    Retiring,
}

impl fmt::Display for FidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FidState::Allocated => write!(f, "allocated"),
            FidState::Active(_) => write!(f, "active"),
            FidState::Retiring => write!(f, "retiring"),
        }
    }
}

/// Proof that a fid entered `Retiring`.
///
/// Only a token can free a retiring number, and only by being consumed.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a retiring fid is only freed by confirm_retire"]
pub struct RetireToken {
    fid: u32,
    generation: u64,
}

#[derive(Debug)]
struct FidTable {
    live: HashMap<u32, FidState>,
    free: Vec<u32>,
    next: u32,
    generation: u64,
    closed: bool,
}

impl FidTable {
    fn state_error(&self, fid: u32) -> Error {
        Error::InvalidFidState {
            fid,
            state: self
                .live
                .get(&fid)
                .map_or_else(|| "free".to_owned(), |s| s.to_string()),
        }
    }

    fn push_free(&mut self, fid: u32) {
        self.live.remove(&fid);
        self.free.push(fid);
    }
}

/// Connection scoped fid allocator.
///
/// All transitions happen under one short, non-async lock, so a number is
/// never observed half way between states.
#[derive(Debug)]
pub struct FidPool {
    table: Mutex<FidTable>,
}

impl Default for FidPool {
    fn default() -> Self {
        Self::new()
    }
}

impl FidPool {
    pub fn new() -> FidPool {
        FidPool {
            table: Mutex::new(FidTable {
                live: HashMap::new(),
                free: Vec::new(),
                next: 1,
                generation: 0,
                closed: false,
            }),
        }
    }

    /// Reserve a number that is in no live state.
    ///
    /// Freed numbers are reused before new ones are minted.
    pub fn allocate(&self) -> Result<u32> {
        let mut t = self.table.lock();
        if t.closed {
            return Err(Error::ConnectionClosed);
        }

        let fid = match t.free.pop() {
            Some(fid) => fid,
            None => {
                if t.next == NOFID {
                    return Err(Error::FidsExhausted);
                }
                let fid = t.next;
                t.next += 1;
                fid
            }
        };
        debug_assert!(!t.live.contains_key(&fid));
        t.live.insert(fid, FidState::Allocated);
        Ok(fid)
    }

    /// Record the server's acknowledgment of attach/walk.
    pub fn mark_active(&self, fid: u32, qid: QId) -> Result<()> {
        let mut t = self.table.lock();
        if t.closed {
            return Err(Error::ConnectionClosed);
        }
        if !matches!(t.live.get(&fid), Some(FidState::Allocated)) {
            return Err(t.state_error(fid));
        }
        t.live.insert(fid, FidState::Active(qid));
        Ok(())
    }

    /// Free a number whose establishing request failed.
    ///
    /// The server never created the fid, so there is nothing to clunk.
    pub fn release_unused(&self, fid: u32) -> Result<()> {
        let mut t = self.table.lock();
        if t.closed {
            return Ok(());
        }
        if !matches!(t.live.get(&fid), Some(FidState::Allocated)) {
            return Err(t.state_error(fid));
        }
        t.push_free(fid);
        Ok(())
    }

    /// Move an active fid to `Retiring`.
    ///
    /// The number stays unavailable until the returned token is confirmed.
    pub fn begin_retire(&self, fid: u32) -> Result<RetireToken> {
        let mut t = self.table.lock();
        if t.closed {
            return Err(Error::ConnectionClosed);
        }
        if !matches!(t.live.get(&fid), Some(FidState::Active(_))) {
            return Err(t.state_error(fid));
        }
        t.live.insert(fid, FidState::Retiring);
        Ok(RetireToken {
            fid,
            generation: t.generation,
        })
    }

    /// Free a retiring number. Call only on receipt of the server's reply.
    pub fn confirm_retire(&self, token: RetireToken) {
        let mut t = self.table.lock();
        if t.closed || token.generation != t.generation {
            return;
        }
        let state = t.live.get(&token.fid).copied();
        if state == Some(FidState::Retiring) {
            t.push_free(token.fid);
            debug!("fid {} retired", token.fid);
        } else {
            debug_assert!(false, "confirm_retire of fid {} in {:?}", token.fid, state);
        }
    }

    /// Forget every fid after the connection failed.
    ///
    /// Later allocations fail with `ConnectionClosed`; outstanding tokens become inert.
    pub fn abort_on_disconnect(&self) {
        let mut t = self.table.lock();
        t.closed = true;
        t.generation += 1;
        let live: Vec<u32> = t.live.keys().copied().collect();
        for fid in live {
            t.push_free(fid);
        }
    }

    /// Current state of `fid`, `None` if the number is free.
    pub fn state(&self, fid: u32) -> Option<FidState> {
        self.table.lock().live.get(&fid).copied()
    }

    /// Number of fids in any live state.
    pub fn live_count(&self) -> usize {
        self.table.lock().live.len()
    }
}
