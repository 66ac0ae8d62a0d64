//! Server pool: candidate endpoints for connect and reconnect.
//!
//! Configured servers come first (shuffled unless `dont_randomize_servers`),
//! servers advertised by the broker are appended after them. Entries are
//! never removed; a server that has failed too often is skipped instead.

use std::time::{Duration, Instant};

use carapace_core::endpoint::Endpoint;
use carapace_core::error::{Error, Result};
use carapace_core::options::ConnectOptions;
use carapace_core::reconnect::ReconnectState;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

/// Where a pool entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Explicit,
    Discovered,
}

/// One candidate server and its connect history.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub endpoint: Endpoint,
    pub origin: Origin,
    /// Consecutive failed attempts
    pub failures: u32,
    pub last_attempt: Option<Instant>,
    pub did_connect: bool,
    pub last_error: Option<String>,
}

impl PoolEntry {
    fn new(endpoint: Endpoint, origin: Origin) -> Self {
        Self {
            endpoint,
            origin,
            failures: 0,
            last_attempt: None,
            did_connect: false,
            last_error: None,
        }
    }
}

/// Ordered, deduplicated list of servers.
#[derive(Debug)]
pub struct ServerPool {
    entries: Vec<PoolEntry>,
    cursor: usize,
    randomize: bool,
    ignore_discovered: bool,
}

impl ServerPool {
    /// Seed the pool from `options.servers`.
    pub fn new(options: &ConnectOptions) -> Result<Self> {
        let mut entries: Vec<PoolEntry> = Vec::with_capacity(options.servers.len());
        for url in &options.servers {
            let endpoint = Endpoint::parse(url)?;
            if entries.iter().any(|e| e.endpoint.address() == endpoint.address()) {
                continue;
            }
            entries.push(PoolEntry::new(endpoint, Origin::Explicit));
        }
        if entries.is_empty() {
            return Err(Error::NoServers { last: None });
        }
        if !options.dont_randomize_servers {
            entries.shuffle(&mut rand::thread_rng());
        }
        debug!("[Pool] Seeded with {} server(s)", entries.len());
        Ok(Self {
            entries,
            cursor: 0,
            randomize: !options.dont_randomize_servers,
            ignore_discovered: options.ignore_discovered_urls,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    /// Next server to try and how long to wait before dialing it.
    ///
    /// Rotates through the pool so a server that just dropped us is tried
    /// last. Returns `None` once every entry is exhausted.
    pub fn next(&mut self, reconnect: &ReconnectState) -> Option<(Endpoint, Duration)> {
        let now = Instant::now();
        let len = self.entries.len();
        for step in 0..len {
            let idx = (self.cursor + step) % len;
            let entry = &mut self.entries[idx];
            if reconnect.exhausted(entry.failures) {
                trace!("[Pool] Skipping exhausted {}", entry.endpoint);
                continue;
            }
            let delay = reconnect.delay_for(entry.last_attempt, now);
            entry.last_attempt = Some(now + delay);
            self.cursor = (idx + 1) % len;
            return Some((entry.endpoint.clone(), delay));
        }
        None
    }

    /// Record the outcome of an attempt against `endpoint`.
    pub fn mark_result(&mut self, endpoint: &Endpoint, outcome: std::result::Result<(), String>) {
        let address = endpoint.address();
        let Some(entry) = self.entries.iter_mut().find(|e| e.endpoint.address() == address) else {
            return;
        };
        match outcome {
            Ok(()) => {
                entry.failures = 0;
                entry.did_connect = true;
                entry.last_error = None;
            }
            Err(reason) => {
                entry.failures = entry.failures.saturating_add(1);
                entry.last_error = Some(reason);
            }
        }
    }

    /// Append servers advertised by the broker. Returns the ones that were new.
    pub fn add_discovered<I>(&mut self, endpoints: I) -> Vec<Endpoint>
    where
        I: IntoIterator<Item = Endpoint>,
    {
        if self.ignore_discovered {
            return Vec::new();
        }
        let mut added: Vec<Endpoint> = Vec::new();
        for endpoint in endpoints {
            let address = endpoint.address();
            let known = self.entries.iter().any(|e| e.endpoint.address() == address)
                || added.iter().any(|e| e.address() == address);
            if !known {
                added.push(endpoint);
            }
        }
        if self.randomize {
            added.shuffle(&mut rand::thread_rng());
        }
        for endpoint in &added {
            debug!("[Pool] Discovered {}", endpoint);
            self.entries.push(PoolEntry::new(endpoint.clone(), Origin::Discovered));
        }
        added
    }

    /// Most recent error recorded on any entry.
    pub fn last_error(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|e| e.last_error.is_some())
            .max_by_key(|e| e.last_attempt)
            .and_then(|e| e.last_error.clone())
    }
}
