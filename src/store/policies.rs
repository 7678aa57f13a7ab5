use std::net::IpAddr;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use trust_dns_resolver::TokioAsyncResolver;

/// Kind of an admission policy. The numeric code travels with the policy
/// snapshot so remote consumers can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Block,
    Reserve,
    Stick,
    Avoid,
}

impl PolicyKind {
    pub fn code(self) -> i32 {
        match self {
            PolicyKind::Block => 1,
            PolicyKind::Reserve => 2,
            PolicyKind::Stick => 3,
            PolicyKind::Avoid => 4,
        }
    }
}

/// Serializable description of a policy, safe to hand to the admin
/// surface: it carries no behavior and no live references.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicySnapshot {
    pub id: String,
    pub issuer: String,
    pub reason: String,
    pub code: i32,
    pub description: String,
    pub addresses: Vec<String>,
}

/// An admission rule: decides per (source, destination host) whether the
/// source may serve. `accept` must be side-effect free and deterministic
/// for fixed inputs; hosts arrive with the port already stripped.
pub trait Policy: Send + Sync {
    fn id(&self) -> &str;
    fn accept(&self, source_id: &str, host: &str) -> bool;
    fn snapshot(&self) -> PolicySnapshot;
}

/// Remove port information from `address`, if any.
pub fn trim_port(address: &str) -> &str {
    // Bracketed IPv6, e.g. "[::1]:443".
    if let Some(stripped) = address.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return &stripped[..end];
        }
    }

    match address.rfind(':') {
        // A bare IPv6 address keeps its colons.
        Some(idx) if !address[..idx].contains(':') => &address[..idx],
        _ => address,
    }
}

static RESOLVER: Lazy<Option<TokioAsyncResolver>> =
    Lazy::new(|| TokioAsyncResolver::tokio_from_system_conf().ok());

/// Find the addresses associated with `address`. IP literals are returned
/// as-is; when resolution is unavailable or fails, the trimmed host is
/// returned wrapped into a list.
pub(crate) async fn lookup_address(address: &str) -> Vec<String> {
    let host = trim_port(address);
    if host.parse::<IpAddr>().is_ok() {
        return vec![host.to_string()];
    }

    let Some(resolver) = RESOLVER.as_ref() else {
        return vec![host.to_string()];
    };

    match timeout(Duration::from_secs(1), resolver.lookup_ip(host)).await {
        Ok(Ok(response)) => {
            let addrs: Vec<String> = response.iter().map(|ip| ip.to_string()).collect();
            if addrs.is_empty() {
                vec![host.to_string()]
            } else {
                addrs
            }
        }
        _ => vec![host.to_string()],
    }
}

/// Disables a source globally.
pub struct BlockPolicy {
    name: String,
    issuer: String,
    reason: String,
    source_id: String,
}

impl BlockPolicy {
    pub fn new(issuer: impl Into<String>, source_id: impl Into<String>) -> Self {
        let source_id = source_id.into();
        Self {
            name: format!("block_{}", source_id),
            issuer: issuer.into(),
            reason: String::new(),
            source_id,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

impl Policy for BlockPolicy {
    fn id(&self) -> &str {
        &self.name
    }

    fn accept(&self, source_id: &str, _host: &str) -> bool {
        source_id != self.source_id
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            id: self.name.clone(),
            issuer: self.issuer.clone(),
            reason: self.reason.clone(),
            code: PolicyKind::Block.code(),
            description: format!("source {} will no longer be used", self.source_id),
            addresses: Vec::new(),
        }
    }
}

/// Reserves a source to a set of destinations: connections to those hosts
/// must use it, and it will not be used for anything else.
pub struct ReservedPolicy {
    name: String,
    issuer: String,
    reason: String,
    source_id: String,
    addrs: Vec<String>,
}

impl ReservedPolicy {
    /// Hosts are DNS-expanded here, once, at policy creation.
    pub async fn new(
        issuer: impl Into<String>,
        source_id: impl Into<String>,
        hosts: &[String],
    ) -> Self {
        let mut addrs = Vec::new();
        for host in hosts {
            addrs.extend(lookup_address(host).await);
        }
        Self::with_addrs(issuer, source_id, addrs)
    }

    pub(crate) fn with_addrs(
        issuer: impl Into<String>,
        source_id: impl Into<String>,
        addrs: Vec<String>,
    ) -> Self {
        let source_id = source_id.into();
        Self {
            name: format!("reserve_{}", source_id),
            issuer: issuer.into(),
            reason: String::new(),
            source_id,
            addrs,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

impl Policy for ReservedPolicy {
    fn id(&self) -> &str {
        &self.name
    }

    fn accept(&self, source_id: &str, host: &str) -> bool {
        if self.addrs.iter().any(|addr| addr == host) {
            source_id == self.source_id
        } else {
            source_id != self.source_id
        }
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            id: self.name.clone(),
            issuer: self.issuer.clone(),
            reason: self.reason.clone(),
            code: PolicyKind::Reserve.code(),
            description: format!(
                "source {} will only be used for connections to {:?}",
                self.source_id, self.addrs
            ),
            addresses: self.addrs.clone(),
        }
    }
}

/// Negative counterpart of [`ReservedPolicy`] without the exclusivity:
/// keeps connections to one host away from a source.
pub struct AvoidPolicy {
    name: String,
    issuer: String,
    reason: String,
    source_id: String,
    host: String,
    addrs: Vec<String>,
}

impl AvoidPolicy {
    pub async fn new(
        issuer: impl Into<String>,
        source_id: impl Into<String>,
        address: &str,
    ) -> Self {
        let host = trim_port(address).to_string();
        let addrs = lookup_address(&host).await;
        Self::with_addrs(issuer, source_id, host, addrs)
    }

    pub(crate) fn with_addrs(
        issuer: impl Into<String>,
        source_id: impl Into<String>,
        host: String,
        addrs: Vec<String>,
    ) -> Self {
        let source_id = source_id.into();
        Self {
            name: format!("avoid_{}_for_{}", source_id, host),
            issuer: issuer.into(),
            reason: String::new(),
            source_id,
            host,
            addrs,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

impl Policy for AvoidPolicy {
    fn id(&self) -> &str {
        &self.name
    }

    fn accept(&self, source_id: &str, host: &str) -> bool {
        if self.addrs.iter().any(|addr| addr == host) {
            source_id != self.source_id
        } else {
            true
        }
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            id: self.name.clone(),
            issuer: self.issuer.clone(),
            reason: self.reason.clone(),
            code: PolicyKind::Avoid.code(),
            description: format!(
                "source {} will not be used for connections to {}",
                self.source_id, self.host
            ),
            addresses: self.addrs.clone(),
        }
    }
}

/// Queries the bind history of a destination host: the source identifier
/// it is pinned to, if any.
pub type HistoryQuery = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Makes connections to an already-seen host stick to the source that
/// served it first.
pub struct StickyPolicy {
    issuer: String,
    reason: String,
    history: HistoryQuery,
}

impl StickyPolicy {
    pub fn new(issuer: impl Into<String>, history: HistoryQuery) -> Self {
        Self {
            issuer: issuer.into(),
            reason: String::new(),
            history,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

impl Policy for StickyPolicy {
    fn id(&self) -> &str {
        "stick"
    }

    fn accept(&self, source_id: &str, host: &str) -> bool {
        match (self.history)(host) {
            Some(bound) => source_id == bound,
            None => true,
        }
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            id: "stick".to_string(),
            issuer: self.issuer.clone(),
            reason: self.reason.clone(),
            code: PolicyKind::Stick.code(),
            description: "once a source receives a connection to an address, the following \
                          connections to the same address will be assigned to the same source"
                .to_string(),
            addresses: Vec::new(),
        }
    }
}
