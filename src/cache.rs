//! URL keyed response cache.
//!
//! Entries keep the origin response split around the value of its `Age`
//! header. A hit rebuilds the head with the Age the origin would report now,
//! so clients see freshness tick down exactly as if they had asked the origin.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CacheSkip;
use crate::response::{headers, ResponseHead};

struct CacheEntry {
    /// Epoch seconds after which the entry must not be served.
    expiry_time: u64,
    /// Epoch seconds at which the origin would have reported `Age: 0`.
    start_time: u64,
    /// Response bytes up to and including `Age: `.
    preamble: Arc<[u8]>,
    /// Response bytes from the CRLF after the Age value onwards.
    suffix: Arc<[u8]>,
    chunks: Option<Arc<[Vec<u8>]>>,
    size: u64,
}

/// A cache hit ready to be written back to the client verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedResponse {
    Whole(Vec<u8>),
    Chunked {
        header: Vec<u8>,
        chunks: Arc<[Vec<u8>]>,
    },
}

impl CachedResponse {
    pub fn len(&self) -> usize {
        match self {
            CachedResponse::Whole(buf) => buf.len(),
            CachedResponse::Chunked { header, chunks } => {
                header.len() + chunks.iter().map(Vec::len).sum::<usize>()
            }
        }
    }
}

pub struct CacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    current_size: AtomicU64,
    bytes_saved: AtomicU64,
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            current_size: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
        }
    }

    /// Returns the fresh entry for `url`, with its Age recomputed for `now`.
    ///
    /// Stale entries are dropped on the way out and reported as misses.
    pub fn lookup(&self, url: &str, now: u64) -> Option<CachedResponse> {
        let (preamble, suffix, chunks, age) = {
            let mut entries = self.entries.lock();
            let entry = entries.get(url)?;

            if now >= entry.expiry_time {
                if let Some(old) = entries.remove(url) {
                    self.current_size.fetch_sub(old.size, Ordering::Relaxed);
                }
                return None;
            }

            self.bytes_saved.fetch_add(entry.size, Ordering::Relaxed);
            (
                entry.preamble.clone(),
                entry.suffix.clone(),
                entry.chunks.clone(),
                now.saturating_sub(entry.start_time),
            )
        };

        let header = rebuild_head(&preamble, age, &suffix);
        Some(match chunks {
            Some(chunks) => CachedResponse::Chunked { header, chunks },
            None => CachedResponse::Whole(header),
        })
    }

    /// Stores `response` (the whole response, or the header segment of a
    /// chunked one followed by `chunks`) under `url`, replacing any prior entry.
    ///
    /// Returns the entry size on success.
    pub fn store(
        &self,
        response: &[u8],
        url: &str,
        chunks: Option<Vec<Vec<u8>>>,
        now: u64,
    ) -> Result<u64, CacheSkip> {
        let head = ResponseHead::inspect(response);

        if head.status == Some(404) {
            return Err(CacheSkip::NotFound);
        }
        if head.no_cache {
            return Err(CacheSkip::NoCache);
        }
        let max_age = head.max_age.ok_or(CacheSkip::NoMaxAge)?;

        if head.has_age && head.age.is_none() {
            return Err(CacheSkip::InvalidAge);
        }
        let present_age = head.age.unwrap_or(0);
        if present_age >= max_age {
            return Err(CacheSkip::AlreadyStale);
        }

        // Anchor Age=0 in the past so the recomputed value keeps matching the origin.
        let start_time = now.saturating_sub(present_age);
        let expiry_time = start_time.saturating_add(max_age);
        let (preamble, suffix) = split_at_age(response).ok_or(CacheSkip::NoMaxAge)?;

        let size = response.len() as u64
            + chunks
                .as_ref()
                .map(|c| c.iter().map(|b| b.len() as u64).sum::<u64>())
                .unwrap_or(0);

        let entry = CacheEntry {
            expiry_time,
            start_time,
            preamble: preamble.into(),
            suffix: suffix.into(),
            chunks: chunks.map(Into::into),
            size,
        };

        let mut entries = self.entries.lock();
        if let Some(old) = entries.insert(url.to_string(), entry) {
            self.current_size.fetch_sub(old.size, Ordering::Relaxed);
        }
        self.current_size.fetch_add(size, Ordering::Relaxed);

        Ok(size)
    }

    /// Drops every entry that is stale at `now`, returning how many went.
    pub fn purge_expired(&self, now: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            let fresh = now < entry.expiry_time;
            if !fresh {
                self.current_size.fetch_sub(entry.size, Ordering::Relaxed);
            }
            fresh
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    pub fn bytes_saved(&self) -> u64 {
        self.bytes_saved.load(Ordering::Relaxed)
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

fn rebuild_head(preamble: &[u8], age: u64, suffix: &[u8]) -> Vec<u8> {
    let age = age.to_string();
    let mut buf = Vec::with_capacity(preamble.len() + age.len() + suffix.len());
    buf.extend_from_slice(preamble);
    buf.extend_from_slice(age.as_bytes());
    buf.extend_from_slice(suffix);
    buf
}

/// Splits a response around its Age value.
///
/// When the origin sent no Age header, one is synthesised on the line after
/// `Cache-Control` and the response is treated as freshly minted.
fn split_at_age(response: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut cache_control_end = None;

    for h in headers(response) {
        if h.is("Age") {
            return Some((
                response[..h.value_start].to_vec(),
                response[h.line_end..].to_vec(),
            ));
        }
        if cache_control_end.is_none()
            && h.is("Cache-Control")
            && crate::response::parse_max_age(h.value).is_some()
        {
            cache_control_end = Some(h.line_end);
        }
    }

    let at = cache_control_end?;
    let mut preamble = Vec::with_capacity(at + 7);
    preamble.extend_from_slice(&response[..at]);
    preamble.extend_from_slice(b"\r\nAge: ");
    Some((preamble, response[at..].to_vec()))
}
