// Replay window: per-transaction bounded history of accepted inbound
// envelopes, served by REPLAY_REQUEST.
//
// Entries are evicted by age (`replay_window_time`) and count
// (`replay_window_size`), whichever bites first, oldest first.  The window
// remembers the highest seq it has ever evicted so a request reaching below
// the surviving range is distinguishable from a request for seqs that were
// simply never buffered.

use haip_protocol::Envelope;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("requested range reaches below the replay window")]
    TooOld,
}

struct Stored {
    envelope: Envelope,
    inserted_at: Instant,
}

pub struct ReplayWindow {
    entries: BTreeMap<u64, Stored>,
    max_age: Duration,
    max_entries: usize,
    /// Highest seq ever evicted; 0 when nothing has been evicted yet.
    evicted_through: u64,
}

impl ReplayWindow {
    pub fn new(max_age: Duration, max_entries: usize) -> Self {
        ReplayWindow {
            entries: BTreeMap::new(),
            max_age,
            max_entries,
            evicted_through: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffers one accepted inbound envelope under its seq, evicting expired
    /// and overflow entries first.
    pub fn insert(&mut self, seq: u64, envelope: Envelope) {
        self.insert_at(seq, envelope, Instant::now());
    }

    fn insert_at(&mut self, seq: u64, envelope: Envelope, now: Instant) {
        self.evict_expired(now);
        while self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(
            seq,
            Stored {
                envelope,
                inserted_at: now,
            },
        );
    }

    /// Entries with `seq` in `[from_seq, to_seq]` (open-ended when `to_seq`
    /// is `None`), ascending.  Errors when the range reaches below what the
    /// window still holds; a range entirely above the newest entry is empty,
    /// not an error.
    pub fn range(
        &mut self,
        from_seq: u64,
        to_seq: Option<u64>,
    ) -> Result<Vec<Envelope>, ReplayError> {
        self.evict_expired(Instant::now());
        if from_seq <= self.evicted_through {
            return Err(ReplayError::TooOld);
        }
        let upper = to_seq.unwrap_or(u64::MAX);
        Ok(self
            .entries
            .range(from_seq..=upper)
            .map(|(_, stored)| stored.envelope.clone())
            .collect())
    }

    fn evict_expired(&mut self, now: Instant) {
        loop {
            let oldest = self
                .entries
                .first_key_value()
                .map(|(&seq, stored)| (seq, stored.inserted_at));
            match oldest {
                Some((seq, inserted_at)) if now.duration_since(inserted_at) > self.max_age => {
                    self.entries.remove(&seq);
                    self.evicted_through = self.evicted_through.max(seq);
                }
                _ => break,
            }
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((seq, _)) = self.entries.pop_first() {
            self.evicted_through = self.evicted_through.max(seq);
        }
    }
}
