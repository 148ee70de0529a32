//! Client identification: real IP extraction, device classification, trust.
//!
//! The real client IP is taken from the forwarded-header chain in fixed
//! precedence (`X-Forwarded-For` first well-formed entry, then `X-Real-IP`,
//! `CF-Connecting-IP`, `X-Client-IP`, finally the socket address). User
//! agents classify by case-insensitive substring rules. Results are memoized
//! per `(ip, ua-hash)` in a bounded LRU so repeat clients skip
//! re-classification while one-off scanners age out first.

use crate::context::{ClientDescriptor, DeviceKind, RequestContext};
use actix_web::HttpRequest;
use ipnet::IpNet;
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Mutex;

/// Header precedence for forwarded client IPs.
const IP_HEADERS: &[&str] = &["X-Forwarded-For", "X-Real-IP", "CF-Connecting-IP", "X-Client-IP"];

const MEMO_CAPACITY: usize = 8192;

/// Loopback and RFC1918 ranges, always trusted.
static DEFAULT_TRUSTED_NETS: Lazy<Vec<IpNet>> = Lazy::new(|| {
    [
        "127.0.0.0/8",
        "::1/128",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
    ]
    .iter()
    .filter_map(|c| c.parse().ok())
    .collect()
});

#[derive(Default)]
struct LruState {
    /// Key to descriptor plus its current recency sequence.
    entries: HashMap<String, (ClientDescriptor, u64)>,
    /// Recency sequence to key; the smallest sequence is the LRU victim.
    recency: BTreeMap<u64, String>,
    next_seq: u64,
}

/// Bounded LRU for classified clients.
///
/// Every hit re-stamps the entry with a fresh sequence number, so eviction
/// at capacity always removes the least recently used key.
struct ClientCache {
    state: Mutex<LruState>,
    capacity: usize,
}

impl ClientCache {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LruState::default()),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &str) -> Option<ClientDescriptor> {
        let mut state = self.state.lock().expect("client cache lock poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;

        let (descriptor, old_seq) = state
            .entries
            .get_mut(key)
            .map(|entry| (entry.0.clone(), std::mem::replace(&mut entry.1, seq)))?;

        state.recency.remove(&old_seq);
        state.recency.insert(seq, key.to_string());
        Some(descriptor)
    }

    fn insert(&self, key: String, descriptor: ClientDescriptor) {
        let mut state = self.state.lock().expect("client cache lock poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;

        if let Some((_, old_seq)) = state.entries.insert(key.clone(), (descriptor, seq)) {
            state.recency.remove(&old_seq);
        }
        state.recency.insert(seq, key);

        while state.entries.len() > self.capacity {
            let Some((_, oldest_key)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&oldest_key);
        }
    }
}

#[cfg(test)]
impl ClientCache {
    fn len(&self) -> usize {
        self.state.lock().expect("client cache lock poisoned").entries.len()
    }
}

pub struct ClientIdentifier {
    trusted_nets: Vec<IpNet>,
    memo: ClientCache,
}

impl ClientIdentifier {
    /// `extra_cidrs` and `extra_ips` extend the default trust list
    /// (loopback and RFC1918). Unparseable entries are skipped; the config
    /// validator reports them at startup.
    pub fn new(extra_cidrs: &[String], extra_ips: &[String]) -> Self {
        let mut trusted_nets: Vec<IpNet> = DEFAULT_TRUSTED_NETS.clone();

        for cidr in extra_cidrs {
            if let Ok(net) = cidr.parse() {
                trusted_nets.push(net);
            }
        }
        for ip in extra_ips {
            if let Ok(addr) = ip.parse::<IpAddr>() {
                trusted_nets.push(IpNet::from(addr));
            }
        }

        Self {
            trusted_nets,
            memo: ClientCache::with_capacity(MEMO_CAPACITY),
        }
    }

    /// Resolves the client descriptor and stores it in the context.
    pub fn identify(&self, req: &HttpRequest, ctx: &mut RequestContext) {
        let ip = extract_client_ip(req).unwrap_or_else(|| "unknown".to_string());
        let user_agent = req
            .headers()
            .get("User-Agent")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let key = memo_key(&ip, user_agent.as_deref());
        if let Some(cached) = self.memo.get(&key) {
            ctx.client = Some(cached);
            return;
        }

        let device = classify_user_agent(user_agent.as_deref());
        let descriptor = ClientDescriptor {
            trusted: self.is_trusted(&ip),
            bot: device == DeviceKind::Bot,
            ip,
            user_agent,
            device,
        };

        self.memo.insert(key, descriptor.clone());
        ctx.client = Some(descriptor);
    }

    fn is_trusted(&self, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return false;
        };
        self.trusted_nets.iter().any(|net| net.contains(&addr))
    }
}

fn memo_key(ip: &str, user_agent: Option<&str>) -> String {
    let mut hasher = ahash::AHasher::default();
    user_agent.unwrap_or("").hash(&mut hasher);
    format!("{}:{:x}", ip, hasher.finish())
}

/// Walks the forwarded-header chain for the first well-formed IP, falling
/// back to the peer socket address.
fn extract_client_ip(req: &HttpRequest) -> Option<String> {
    for header in IP_HEADERS {
        let Some(value) = req.headers().get(*header).and_then(|v| v.to_str().ok()) else {
            continue;
        };

        // X-Forwarded-For may carry a chain; the others hold one address.
        for candidate in value.split(',') {
            let candidate = candidate.trim();
            if candidate.parse::<IpAddr>().is_ok() {
                return Some(candidate.to_string());
            }
        }
    }

    req.peer_addr().map(|addr| addr.ip().to_string())
}

/// Case-insensitive substring classification.
///
/// `bot|crawler|spider` wins first; tablet keywords refine what would
/// otherwise classify as mobile.
fn classify_user_agent(user_agent: Option<&str>) -> DeviceKind {
    let Some(ua) = user_agent else {
        return DeviceKind::Desktop;
    };
    let ua = ua.to_ascii_lowercase();

    if ["bot", "crawler", "spider"].iter().any(|kw| ua.contains(kw)) {
        return DeviceKind::Bot;
    }
    if ["ipad", "tablet", "kindle"].iter().any(|kw| ua.contains(kw)) {
        return DeviceKind::Tablet;
    }
    if ["android", "iphone", "mobile", "phone"]
        .iter()
        .any(|kw| ua.contains(kw))
    {
        return DeviceKind::Mobile;
    }

    DeviceKind::Desktop
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    fn ctx_for(req: &HttpRequest) -> RequestContext {
        RequestContext::new(req)
    }

    fn descriptor(ip: &str) -> ClientDescriptor {
        ClientDescriptor {
            ip: ip.to_string(),
            user_agent: None,
            device: DeviceKind::Desktop,
            bot: false,
            trusted: false,
        }
    }

    #[test]
    fn forwarded_for_wins_over_real_ip() {
        let identifier = ClientIdentifier::new(&[], &[]);
        let req = TestRequest::get()
            .insert_header(("X-Forwarded-For", "203.0.113.7, 10.0.0.1"))
            .insert_header(("X-Real-IP", "198.51.100.4"))
            .to_http_request();
        let mut ctx = ctx_for(&req);

        identifier.identify(&req, &mut ctx);
        assert_eq!(ctx.client.unwrap().ip, "203.0.113.7");
    }

    #[test]
    fn malformed_forwarded_entries_are_skipped() {
        let identifier = ClientIdentifier::new(&[], &[]);
        let req = TestRequest::get()
            .insert_header(("X-Forwarded-For", "not-an-ip, 203.0.113.9"))
            .to_http_request();
        let mut ctx = ctx_for(&req);

        identifier.identify(&req, &mut ctx);
        assert_eq!(ctx.client.unwrap().ip, "203.0.113.9");
    }

    #[test]
    fn rfc1918_addresses_are_trusted_by_default() {
        let identifier = ClientIdentifier::new(&[], &[]);
        let req = TestRequest::get()
            .insert_header(("X-Real-IP", "192.168.1.50"))
            .to_http_request();
        let mut ctx = ctx_for(&req);

        identifier.identify(&req, &mut ctx);
        assert!(ctx.client.unwrap().trusted);
    }

    #[test]
    fn public_addresses_are_untrusted_unless_listed() {
        let req = TestRequest::get()
            .insert_header(("X-Real-IP", "203.0.113.7"))
            .to_http_request();

        let identifier = ClientIdentifier::new(&[], &[]);
        let mut ctx = ctx_for(&req);
        identifier.identify(&req, &mut ctx);
        assert!(!ctx.client.unwrap().trusted);

        let identifier = ClientIdentifier::new(&["203.0.113.0/24".to_string()], &[]);
        let mut ctx = ctx_for(&req);
        identifier.identify(&req, &mut ctx);
        assert!(ctx.client.unwrap().trusted);
    }

    #[test]
    fn user_agent_classification_rules() {
        let cases = [
            ("Googlebot/2.1 (+http://www.google.com/bot.html)", DeviceKind::Bot),
            ("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)", DeviceKind::Mobile),
            ("Mozilla/5.0 (iPad; CPU OS 17_0)", DeviceKind::Tablet),
            ("Mozilla/5.0 (Linux; Android 14; Tablet)", DeviceKind::Tablet),
            ("Mozilla/5.0 (X11; Linux x86_64)", DeviceKind::Desktop),
        ];

        for (ua, expected) in cases {
            assert_eq!(classify_user_agent(Some(ua)), expected, "ua: {}", ua);
        }
        assert_eq!(classify_user_agent(None), DeviceKind::Desktop);
    }

    #[test]
    fn ipv6_addresses_validate() {
        let identifier = ClientIdentifier::new(&[], &[]);
        let req = TestRequest::get()
            .insert_header(("X-Forwarded-For", "2001:db8::1"))
            .to_http_request();
        let mut ctx = ctx_for(&req);

        identifier.identify(&req, &mut ctx);
        assert_eq!(ctx.client.unwrap().ip, "2001:db8::1");
    }

    #[test]
    fn lru_evicts_the_least_recently_used_key() {
        let cache = ClientCache::with_capacity(2);
        cache.insert("a".to_string(), descriptor("10.0.0.1"));
        cache.insert("b".to_string(), descriptor("10.0.0.2"));

        // Touch "a" so "b" becomes the LRU victim.
        assert!(cache.get("a").is_some());
        cache.insert("c".to_string(), descriptor("10.0.0.3"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn lru_reinsert_updates_in_place() {
        let cache = ClientCache::with_capacity(2);
        cache.insert("a".to_string(), descriptor("10.0.0.1"));
        cache.insert("a".to_string(), descriptor("10.0.0.9"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a").unwrap().ip, "10.0.0.9");
    }

    #[test]
    fn lru_stays_within_capacity_under_churn() {
        let cache = ClientCache::with_capacity(8);
        for i in 0..100 {
            cache.insert(format!("key-{}", i), descriptor("10.0.0.1"));
        }
        assert_eq!(cache.len(), 8);
        // The newest keys survive.
        assert!(cache.get("key-99").is_some());
        assert!(cache.get("key-0").is_none());
    }
}
