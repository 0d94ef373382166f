// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! A bounded LRU cache of upstream responses, keyed by (name, type, class).

use bytes::{Bytes, BytesMut};
use clru::CLruCache;
use domain::{
    base::{
        iana::{Class, Rcode},
        Message, MessageBuilder, ParseError, Rtype, ShortBuf,
    },
    rdata::AllRecordData,
};
use log::*;
use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::MAX_LEN;

/// Errors from rebuilding a cached message with adjusted TTLs. These never
/// reach a client: if rebuilding fails the cache simply treats the lookup
/// as a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    ShortBuf(#[from] ShortBuf),
}

/// (lowercased fully-qualified name, rr-type, rr-class).
pub type CacheKey = (Box<str>, Rtype, Class);

struct CacheEntry {
    message: Message<Bytes>,
    inserted: Instant,
    ttl: Duration,
}

/// A thread-shared, bounded LRU response cache.
#[derive(Clone)]
pub struct RespCache {
    cache: Arc<Mutex<CLruCache<CacheKey, CacheEntry>>>,
    negative_ttl: Duration,
}

impl RespCache {
    pub fn new(size: NonZeroUsize, negative_ttl: Duration) -> Self {
        Self {
            cache: Arc::new(Mutex::new(CLruCache::new(size))),
            negative_ttl,
        }
    }

    /// Build the cache key for a client query. `None` if the query carries
    /// no question (malformed requests never reach the cache anyway).
    pub fn key_for(msg: &Message<Bytes>) -> Option<CacheKey> {
        let q = msg.first_question()?;
        Some((
            q.qname().to_string().to_ascii_lowercase().into_boxed_str(),
            q.qtype(),
            q.qclass(),
        ))
    }

    /// Look up `key`, returning a response with every record's TTL
    /// decremented by the entry's age (clamped to at least 1s) and the
    /// header ID restamped to `query_id`. Returns `None` if absent or
    /// expired; an expired entry is evicted.
    pub fn lookup(&self, key: &CacheKey, query_id: u16) -> Option<Message<Bytes>> {
        let mut guard = self.cache.lock().unwrap();
        let entry = guard.get(key)?;
        let age = Instant::now().saturating_duration_since(entry.inserted);
        if age >= entry.ttl {
            guard.pop(key);
            return None;
        }
        let remaining = (entry.ttl - age).as_secs().max(1) as u32;
        let message = entry.message.clone();
        drop(guard);
        match rebuild(&message, query_id, Some(remaining)) {
            Ok(adjusted) => {
                debug!("Cache hit for {} {} {}", key.0, key.1, key.2);
                Some(adjusted)
            }
            Err(e) => {
                warn!("failed to rebuild cached response, treating as a miss: {}", e);
                None
            }
        }
    }

    /// Insert `response` under `key`. SERVFAIL responses are rejected; the
    /// stored TTL is the minimum across the answer section, or the
    /// configured negative TTL for empty/negative answers.
    pub fn insert(&self, key: CacheKey, response: Message<Bytes>) {
        let rcode = response.header().rcode();
        if rcode == Rcode::ServFail {
            info!("response was SERVFAIL, not caching");
            return;
        }

        let min_ttl = response.answer().ok().and_then(|records| {
            records.filter(|r| r.is_ok()).map(|r| r.unwrap().ttl()).min()
        });

        let ttl = match min_ttl {
            Some(t) if t > 0 => Duration::from_secs(u64::from(t)),
            _ => self.negative_ttl,
        };

        self.cache.lock().unwrap().put(
            key,
            CacheEntry {
                message: response,
                inserted: Instant::now(),
                ttl,
            },
        );
    }
}

/// Rebuild `msg` with its header ID set to `id`, optionally overriding every
/// record's TTL. Shared by cache lookups (which override the TTL) and
/// upstream responses (which only need the ID restamped back to the
/// client's original query ID).
pub(crate) fn rebuild(msg: &Message<Bytes>, id: u16, ttl_override: Option<u32>) -> Result<Message<Bytes>, CacheError> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))?;
    *builder.header_mut() = msg.header();
    builder.header_mut().set_id(id);

    let mut builder = builder.question();
    for item in msg.question().flatten() {
        builder.push(item)?;
    }

    let mut builder = builder.answer();
    for item in msg.answer()? {
        if let Some(mut record) = item?.into_record::<AllRecordData<_, _>>()? {
            if let Some(ttl) = ttl_override {
                record.set_ttl(ttl);
            }
            builder.push(record)?;
        }
    }

    let mut builder = builder.authority();
    for item in msg.authority()? {
        if let Some(mut record) = item?.into_record::<AllRecordData<_, _>>()? {
            if let Some(ttl) = ttl_override {
                record.set_ttl(ttl);
            }
            builder.push(record)?;
        }
    }

    let mut builder = builder.additional();
    for item in msg.additional()? {
        if let Some(mut record) = item?.into_record::<AllRecordData<_, _>>()? {
            if let Some(ttl) = ttl_override {
                record.set_ttl(ttl);
            }
            builder.push(record)?;
        }
    }

    Ok(builder.into_message())
}
