//! The entry table and the expiry scheduler.
//!
//! [`KeepState`] is a plain state machine without any I/O: every operation takes the current
//! instant explicitly, and the scheduler returns the paths whose background refresh has to be
//! launched. The actor in [`super`] is the only owner of a [`KeepState`].

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;

use super::protocol::{Fetching, Waiter};

/// A `fetched` message arrived for a path that has no outstanding fetch.
///
/// Continuing after this would break the at-most-one-fetch guarantee, so the actor stops.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("received a completed fetch for `{path}`, which is not being fetched")]
pub struct ProtocolViolation {
    pub path: String,
}

/// The coordination record of a single path.
#[derive(Debug)]
struct Entry {
    /// Number of `request` messages seen for this path.
    count: u64,
    last_fetched: Instant,
    fetching: bool,
    /// Followers waiting for the outstanding fetch, in arrival order.
    waiters: Vec<Waiter>,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            // a fresh entry is due for its first refresh one ttl from now
            last_fetched: now,
            fetching: false,
            waiters: Vec::new(),
        }
    }
}

/// A read-only view on an entry, as reported by [`Keep::entries`](super::Keep::entries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub path: String,
    pub count: u64,
    pub fetching: bool,
    pub waiters: usize,
    /// Time since the last fetch completed, or since the entry was created.
    #[serde(with = "humantime_serde")]
    pub since_fetched: Duration,
}

#[derive(Debug)]
pub struct KeepState {
    ttl: Duration,
    entries: HashMap<String, Entry>,
    /// The single armed wake-up deadline.
    timer: Option<Instant>,
}

impl KeepState {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            timer: None,
        }
    }

    fn entry(&mut self, path: &str, now: Instant) -> &mut Entry {
        self.entries.entry(path.to_owned()).or_insert_with(|| {
            tracing::trace!(path, "Creating keep entry");
            Entry::new(now)
        })
    }

    /// Records that a client asked for `path`.
    pub fn request(&mut self, path: &str, now: Instant) {
        self.entry(path, now).count += 1;
    }

    /// Asks for permission to fetch `path`.
    ///
    /// If nobody is fetching the path yet, the path is marked as fetching and the `waiter` is
    /// handed back: its owner is the leader and has to be told so. Otherwise the waiter is queued
    /// until the outstanding fetch completes and `None` is returned.
    pub fn fetching(&mut self, path: &str, waiter: Waiter, now: Instant) -> Option<Waiter> {
        let entry = self.entry(path, now);
        if entry.fetching {
            tracing::trace!(path, waiters = entry.waiters.len() + 1, "Adding waiter");
            entry.waiters.push(waiter);
            None
        } else {
            entry.fetching = true;
            Some(waiter)
        }
    }

    /// Completes the outstanding fetch of `path` and releases all its waiters.
    ///
    /// Every waiter receives the same `data`, or [`Fetching::Failed`] if the fetch did not
    /// produce any. Returns the number of released waiters.
    pub fn fetched(
        &mut self,
        path: &str,
        data: Option<Bytes>,
        now: Instant,
    ) -> Result<usize, ProtocolViolation> {
        let entry = match self.entries.get_mut(path) {
            Some(entry) if entry.fetching => entry,
            _ => {
                return Err(ProtocolViolation {
                    path: path.to_owned(),
                });
            }
        };

        entry.last_fetched = entry.last_fetched.max(now);
        entry.fetching = false;

        if data.is_none() {
            tracing::debug!(path, "No data fetched");
        }

        let waiters = std::mem::take(&mut entry.waiters);
        let released = waiters.len();
        for waiter in waiters {
            let answer = match data {
                Some(ref data) => Fetching::Data(data.clone()),
                None => Fetching::Failed,
            };
            // the follower may have given up waiting, which is fine
            waiter.send(answer).ok();
        }
        Ok(released)
    }

    /// The currently armed deadline.
    pub fn timer(&self) -> Option<Instant> {
        self.timer
    }

    /// Disarms the timer after it fired.
    pub fn timer_fired(&mut self) {
        self.timer = None;
    }

    /// Runs the expiry scheduler.
    ///
    /// Marks every overdue entry as fetching and returns their paths, the caller has to launch a
    /// background refresh for each of them. Afterwards the timer is armed for the earliest
    /// deadline of the remaining entries, unless a timer is already armed.
    pub fn service_timer(&mut self, now: Instant) -> Vec<String> {
        let mut refreshes = Vec::new();
        loop {
            refreshes.extend(self.refresh_expired(now));

            match self.next_deadline() {
                None => break,
                Some(deadline) if deadline <= now => continue,
                Some(deadline) => {
                    if self.timer.is_none() {
                        self.timer = Some(deadline);
                    }
                    break;
                }
            }
        }
        refreshes
    }

    fn refresh_expired(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.ttl;
        let mut refreshes = Vec::new();
        for (path, entry) in &mut self.entries {
            if entry.fetching || entry.last_fetched + ttl > now {
                continue;
            }
            tracing::debug!(path, "Refreshing expired entry");
            entry.fetching = true;
            refreshes.push(path.clone());
        }
        refreshes
    }

    /// The earliest point in time one of the idle entries expires.
    fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|entry| !entry.fetching)
            .map(|entry| entry.last_fetched)
            .min()
            .map(|earliest| earliest + self.ttl)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lists all entries, ordered by path.
    pub fn snapshot(&self, now: Instant) -> Vec<EntryInfo> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(path, entry)| EntryInfo {
                path: path.clone(),
                count: entry.count,
                fetching: entry.fetching,
                waiters: entry.waiters.len(),
                since_fetched: now.saturating_duration_since(entry.last_fetched),
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }
}
