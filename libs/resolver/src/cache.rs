use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use dns_wire::{QueryClass, RecordType, Response, Ttl};
use lru::LruCache;
use parking_lot::Mutex;

/// Bounded LRU of answered messages, keyed by the question tuple.
///
/// Values are stored in wire format; a hit is re-parsed and gets the current
/// query's transaction id, everything else stays byte-identical. Lookups and
/// insertions never hold the lock across an await point, so concurrent misses
/// for the same key may race each other to the upstream. That duplicate work
/// is accepted.
pub(crate) struct ResponseCache {
    inner: Mutex<LruCache<CacheKey, CacheEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: QueryClass,
}

struct CacheEntry {
    wire: Vec<u8>,
    expires_at: Instant,
}

const CAPACITY: usize = 1024;

/// Entries live at least this long, even when the records say less.
/// Serving slightly stale answers is deliberate: it keeps chatty clients off
/// the upstreams.
const TTL_FLOOR: Duration = Duration::from_secs(300);

impl ResponseCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    pub(crate) fn get(&self, key: &CacheKey) -> Option<Response> {
        let mut cache = self.inner.lock();

        let entry = cache.get(key)?;
        let expired = entry.expires_at <= Instant::now();
        let wire = entry.wire.clone();

        if expired {
            cache.pop(key);
            return None;
        }

        Response::parse(&wire).ok()
    }

    pub(crate) fn insert(&self, key: CacheKey, response: &Response) {
        let Some(ttl) = cache_ttl(response.min_ttl()) else {
            return;
        };

        tracing::debug!(name = %key.name, qtype = %key.qtype, ?ttl, "Caching response");

        self.inner.lock().put(
            key,
            CacheEntry {
                wire: response.as_bytes().to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// `max(300s, min(rr ttl))`; a zero TTL anywhere means "do not cache".
fn cache_ttl(min_ttl: Option<Ttl>) -> Option<Duration> {
    match min_ttl.map(|t| t.as_secs()) {
        Some(0) => None,
        Some(secs) => Some(TTL_FLOOR.max(Duration::from_secs(u64::from(secs)))),
        None => Some(TTL_FLOOR),
    }
}

#[cfg(test)]
mod tests {
    use dns_wire::{DomainName, Query, ResponseBuilder, ResponseCode, records};
    use std::net::Ipv4Addr;

    use super::*;

    fn response(ttl: u32) -> (Query, Response) {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query = Query::new(domain.clone(), RecordType::A);
        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_records([(domain, ttl, records::a(Ipv4Addr::new(1, 2, 3, 4)))])
            .build();

        (query, response)
    }

    fn key(query: &Query) -> CacheKey {
        CacheKey {
            name: query.domain().to_string(),
            qtype: query.qtype(),
            qclass: query.qclass(),
        }
    }

    #[test]
    fn ttl_is_clamped_to_the_floor() {
        assert_eq!(cache_ttl(Some(Ttl::from_secs(60))), Some(TTL_FLOOR));
        assert_eq!(
            cache_ttl(Some(Ttl::from_secs(3600))),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(cache_ttl(None), Some(TTL_FLOOR));
    }

    #[test]
    fn zero_ttl_is_never_cached() {
        assert_eq!(cache_ttl(Some(Ttl::from_secs(0))), None);

        let cache = ResponseCache::new();
        let (query, response) = response(0);

        cache.insert(key(&query), &response);

        assert!(cache.get(&key(&query)).is_none());
    }

    #[test]
    fn hits_are_byte_identical_after_the_header() {
        let cache = ResponseCache::new();
        let (query, response) = response(600);

        cache.insert(key(&query), &response);
        let hit = cache.get(&key(&query)).unwrap().with_id(4242);

        assert_eq!(hit.id(), 4242);
        assert_eq!(&hit.as_bytes()[12..], &response.as_bytes()[12..]);
    }

    #[test]
    fn capacity_is_enforced_by_lru_order() {
        let cache = ResponseCache::new();
        let (query, response) = response(600);

        for i in 0..(CAPACITY + 1) {
            let mut key = key(&query);
            key.name = format!("host{i}.example.com");
            cache.insert(key, &response);
        }

        let mut evicted = key(&query);
        evicted.name = "host0.example.com".to_owned();
        assert!(cache.get(&evicted).is_none());

        let mut kept = key(&query);
        kept.name = format!("host{CAPACITY}.example.com");
        assert!(cache.get(&kept).is_some());
    }
}
