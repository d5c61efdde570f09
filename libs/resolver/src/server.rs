use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use dns_wire::{Query, QueryClass, RecordType, Response, ResponseCode};
use tokio::net::UdpSocket;

use crate::cache::{CacheKey, ResponseCache};
use crate::corpus::{Corpus, Verdict};
use crate::publish::{IpSetSink, SetNames};
use crate::upstream::Upstreams;

/// One resolver instance, shared across all in-flight queries.
pub struct Resolver {
    corpus: Corpus,
    upstreams: Upstreams,
    sets: SetNames,
    sink: Arc<dyn IpSetSink>,
    cache: ResponseCache,
}

impl Resolver {
    pub fn new(
        corpus: Corpus,
        upstreams: Upstreams,
        sets: SetNames,
        sink: Arc<dyn IpSetSink>,
    ) -> Self {
        Self {
            corpus,
            upstreams,
            sets,
            sink,
            cache: ResponseCache::new(),
        }
    }

    /// Serves queries from the given socket until the socket fails.
    ///
    /// Each message is handled in its own task; there is no connection state
    /// and no cancellation path for in-flight queries other than process exit.
    pub async fn serve(self: Arc<Self>, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);

        let local_addr = socket.local_addr().context("No local address")?;
        tracing::info!(%local_addr, "Listening for DNS queries");

        // On the public Internet, any MTU > 1500 is very unlikely so 2000 is a safe bet.
        let mut buffer = vec![0u8; 2000];
        loop {
            let (len, from) = socket
                .recv_from(&mut buffer)
                .await
                .context("Failed to receive UDP packet")?;

            let payload = buffer[..len].to_vec();
            let resolver = Arc::clone(&self);
            let socket = Arc::clone(&socket);

            tokio::spawn(async move {
                let Some(reply) = resolver.handle_message(&payload).await else {
                    return;
                };

                if let Err(e) = socket.send_to(&reply, from).await {
                    tracing::warn!(%from, "Failed to send DNS response: {e}");
                }
            });
        }
    }

    /// Handles one inbound message and returns the reply to send, if any.
    pub async fn handle_message(&self, payload: &[u8]) -> Option<Vec<u8>> {
        match Query::parse(payload) {
            Ok(query) => self.handle_query(&query).await,
            Err(e) if e.is_relayable() => {
                tracing::debug!("Unclassifiable message ({e}), forwarding verbatim");
                self.relay(payload).await
            }
            Err(e) => {
                tracing::debug!("Dropping malformed message: {e}");
                None
            }
        }
    }

    async fn handle_query(&self, query: &Query) -> Option<Vec<u8>> {
        let name = query.domain().to_string();
        let key = CacheKey {
            name,
            qtype: query.qtype(),
            qclass: query.qclass(),
        };

        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(name = %key.name, qtype = %key.qtype, "Serving from cache");
            return Some(hit.with_id(query.id()).into_bytes());
        }

        if self.corpus.is_blocked(&key.name) {
            tracing::info!(name = %key.name, "Refusing blocked name");
            return Some(Response::nxdomain(query).into_bytes());
        }

        let classifiable = query.qclass() == QueryClass::IN
            && matches!(query.qtype(), RecordType::A | RecordType::AAAA);
        if !classifiable {
            return self.relay(query.as_bytes()).await;
        }

        match self.corpus.classify(&key.name) {
            Verdict::Direct => self.forward(query, key, Verdict::Direct).await,
            Verdict::Proxy => self.forward(query, key, Verdict::Proxy).await,
            Verdict::Unknown => self.race(query, key).await,
        }
    }

    /// Forwards to the upstream the verdict names and serves its answer.
    async fn forward(&self, query: &Query, key: CacheKey, verdict: Verdict) -> Option<Vec<u8>> {
        tracing::debug!(name = %key.name, ?verdict, "Forwarding query");

        let reply = match verdict {
            Verdict::Proxy => self.upstreams.exchange_proxy(query.as_bytes()).await,
            Verdict::Direct | Verdict::Unknown => {
                self.upstreams.exchange_direct(query.as_bytes()).await
            }
        };

        let bytes = match reply {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(name = %key.name, "Upstream exchange failed: {e:#}");
                return Some(Response::servfail(query).into_bytes());
            }
        };

        let response = match Response::parse(&bytes) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(name = %key.name, "Bad upstream response: {e}");
                return Some(Response::servfail(query).into_bytes());
            }
        };

        if response.response_code() != ResponseCode::NOERROR {
            tracing::warn!(name = %key.name, code = %response.response_code(), "Upstream returned an error, dropping");
            return None;
        }

        self.publish(&response, verdict);
        self.cache.insert(key, &response);

        Some(response.into_bytes())
    }

    /// The race path: query both upstreams in parallel and pick a winner.
    ///
    /// The direct answer wins only when every `A` record it carries lies
    /// within the direct region; AAAA records are exempt from that test
    /// because there is no v6 range table.
    async fn race(&self, query: &Query, key: CacheKey) -> Option<Vec<u8>> {
        tracing::debug!(name = %key.name, "Racing both upstreams");

        let (direct, proxy) = tokio::join!(
            self.upstreams.exchange_direct(query.as_bytes()),
            self.upstreams.exchange_proxy(query.as_bytes()),
        );

        let direct = direct
            .inspect_err(|e| tracing::debug!(name = %key.name, "Direct upstream lost the race: {e:#}"))
            .ok()
            .and_then(|bytes| Response::parse(&bytes).ok());
        let proxy = proxy
            .inspect_err(|e| tracing::debug!(name = %key.name, "Proxy upstream lost the race: {e:#}"))
            .ok()
            .and_then(|bytes| Response::parse(&bytes).ok());

        if let Some(response) = &direct {
            let usable = response.response_code() == ResponseCode::NOERROR
                && response.answer_count() > 0
                && self.all_v4_in_direct_region(response);

            if usable {
                tracing::debug!(name = %key.name, "Race verdict: direct");
                self.publish(response, Verdict::Direct);
                self.cache.insert(key, response);
                return Some(response.as_bytes().to_vec());
            }
        }

        if let Some(response) = &proxy {
            let usable =
                response.response_code() == ResponseCode::NOERROR && response.answer_count() > 0;

            if usable {
                tracing::debug!(name = %key.name, "Race verdict: proxy");
                self.publish(response, Verdict::Proxy);
                self.cache.insert(key, response);
                return Some(response.as_bytes().to_vec());
            }
        }

        // Neither answer qualified; serve whatever came back, uncached.
        match direct.or(proxy) {
            Some(response) => {
                tracing::debug!(name = %key.name, "Race inconclusive, serving as-is");
                Some(response.into_bytes())
            }
            None => Some(Response::servfail(query).into_bytes()),
        }
    }

    fn all_v4_in_direct_region(&self, response: &Response) -> bool {
        response
            .ips()
            .filter(|ip| ip.is_ipv4())
            .all(|ip| self.corpus.routes_contain(ip))
    }

    /// Publishes every answered address into exactly one of the four sets.
    ///
    /// v4 membership is decided by the route table regardless of the verdict;
    /// v6 follows the verdict because the route table carries no v6 ranges.
    fn publish(&self, response: &Response, verdict: Verdict) {
        for ip in response.ips() {
            let set = match ip {
                IpAddr::V4(_) => {
                    if self.corpus.routes_contain(ip) {
                        &self.sets.white4
                    } else {
                        &self.sets.black4
                    }
                }
                IpAddr::V6(_) => match verdict {
                    Verdict::Direct => &self.sets.white6,
                    Verdict::Proxy | Verdict::Unknown => &self.sets.black6,
                },
            };

            self.sink.add(set, ip);
        }
    }

    /// Forwards a message to the direct upstream unchanged ("fallback").
    ///
    /// The client gets an answer either way: when the upstream is
    /// unreachable, the query itself is rewritten into a SERVFAIL.
    async fn relay(&self, payload: &[u8]) -> Option<Vec<u8>> {
        match self.upstreams.exchange_direct(payload).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                tracing::warn!("Fallback forward failed: {e:#}");
                servfail_in_place(payload)
            }
        }
    }
}

/// Builds a minimal SERVFAIL from raw query bytes by flipping the header in
/// place: QR set, RCODE = SERVFAIL, id and question untouched.
fn servfail_in_place(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < 12 {
        return None;
    }

    let mut reply = payload.to_vec();
    reply[2] |= 0x80;
    reply[3] = (reply[3] & 0xF0) | 2;

    Some(reply)
}

#[cfg(test)]
mod tests {
    use dns_wire::DomainName;

    use super::*;

    #[test]
    fn servfail_rewrite_keeps_id_and_question() {
        let query = Query::new(
            DomainName::vec_from_str("example.com").unwrap(),
            RecordType::A,
        )
        .with_id(0x1234);

        let reply = servfail_in_place(query.as_bytes()).unwrap();

        let response = Response::parse(&reply).unwrap();
        assert_eq!(response.id(), 0x1234);
        assert_eq!(response.response_code(), ResponseCode::SERVFAIL);
        assert_eq!(response.domain(), query.domain());
    }

    #[test]
    fn truncated_garbage_cannot_become_a_servfail() {
        assert!(servfail_in_place(&[0u8; 4]).is_none());
    }
}
