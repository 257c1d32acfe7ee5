//! Admission control for new capture requests.
//!
//! Checks run in a fixed order and each one is a hard rejection:
//!
//! 1. at least one capture action is requested
//! 2. the URL is absolute `http`/`https`
//! 3. the host is a plain RFC 1123 name (no `localhost`, no IP literals)
//! 4. every resolved address is outside the private IPv4 ranges
//! 5. the waiting queue has room
//! 6. the origin has no unfinished job
//!
//! Steps 5 and 6 happen inside [`JobStore::try_admit`] together with the
//! insertion. DNS resolution happens before the store lock is taken.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use regex::Regex;
use url::{Host, Url};

use crate::error::{Result, ValidationError};
use crate::scheduler::job::{Job, JobId, RequestedActions};
use crate::scheduler::store::JobStore;

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$",
    )
    .expect("hostname pattern is valid")
});

static IPV4_LITERAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])$",
    )
    .expect("ipv4 pattern is valid")
});

/// RFC 1123 limits on a single label and on the whole name.
const MAX_LABEL_LEN: usize = 63;
const MAX_HOSTNAME_LEN: usize = 253;

const PRIVATE_RANGES: [(Ipv4Addr, u8); 3] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

/// Hostname to address resolution used by the SSRF check.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolves through the operating system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Fixed host table. Unknown hosts fail to resolve.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addr: IpAddr) -> Self {
        self.hosts
            .entry(host.to_ascii_lowercase())
            .or_default()
            .push(addr);
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no such host: {}", host),
                )
            })
    }
}

pub fn ip_within_private_range(ip: IpAddr) -> bool {
    let v4 = match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4,
            None => return false,
        },
    };

    PRIVATE_RANGES.iter().any(|&(base, prefix)| {
        match Ipv4Network::new(base, prefix) {
            Ok(network) => network.contains(v4),
            Err(e) => {
                // A broken range table must fail closed.
                tracing::error!(error = %e, "Invalid private range definition");
                true
            }
        }
    })
}

/// Syntactic URL checks (steps 2 and 3). Returns the hostname to resolve.
pub fn validate_url_syntax(raw: &str) -> std::result::Result<String, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::MissingUrl);
    }

    let url = Url::parse(raw).map_err(|e| match e {
        url::ParseError::EmptyHost => ValidationError::EmptyHost,
        url::ParseError::IdnaError | url::ParseError::InvalidDomainCharacter => {
            ValidationError::InvalidHostname(raw.to_string())
        }
        other => ValidationError::InvalidUrl(other.to_string()),
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::InvalidScheme(url.scheme().to_string()));
    }

    let host = match url.host() {
        None => return Err(ValidationError::EmptyHost),
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => {
            return Err(ValidationError::IpAddressNotAllowed)
        }
        Some(Host::Domain(domain)) => domain.to_string(),
    };

    if host.is_empty() {
        return Err(ValidationError::EmptyHost);
    }
    if host.eq_ignore_ascii_case("localhost") {
        return Err(ValidationError::LocalhostNotAllowed);
    }
    if IPV4_LITERAL_RE.is_match(&host) {
        return Err(ValidationError::IpAddressNotAllowed);
    }
    if !HOSTNAME_RE.is_match(&host) {
        return Err(ValidationError::InvalidHostname(host));
    }
    if host.len() > MAX_HOSTNAME_LEN || host.split('.').any(|label| label.len() > MAX_LABEL_LEN) {
        return Err(ValidationError::InvalidHostname(host));
    }

    Ok(host)
}

/// Validates and admits submissions into a [`JobStore`].
#[derive(Clone)]
pub struct AdmissionController {
    store: JobStore,
    resolver: Arc<dyn HostResolver>,
    max_queue: usize,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("max_queue", &self.max_queue)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    pub fn new(store: JobStore, resolver: Arc<dyn HostResolver>, max_queue: usize) -> Self {
        Self {
            store,
            resolver,
            max_queue,
        }
    }

    /// URL checks including DNS resolution (steps 2 to 4).
    pub async fn validate_url(&self, raw: &str) -> std::result::Result<(), ValidationError> {
        let host = validate_url_syntax(raw)?;

        let addrs = self
            .resolver
            .resolve(&host)
            .await
            .map_err(|e| ValidationError::ResolutionFailed {
                host: host.clone(),
                reason: e.to_string(),
            })?;

        if addrs.is_empty() {
            return Err(ValidationError::ResolutionFailed {
                host,
                reason: "no addresses returned".to_string(),
            });
        }

        if let Some(private) = addrs.into_iter().find(|ip| ip_within_private_range(*ip)) {
            return Err(ValidationError::PrivateAddress(private));
        }

        Ok(())
    }

    /// Run every admission check and enqueue the job.
    pub async fn submit(
        &self,
        url: &str,
        origin: IpAddr,
        actions: RequestedActions,
    ) -> Result<JobId> {
        if actions.is_empty() {
            return Err(ValidationError::NoActions.into());
        }

        if let Err(e) = self.validate_url(url).await {
            tracing::warn!(origin = %origin, url, error = %e, "Submission rejected");
            return Err(e.into());
        }

        let job = Job::new(url.trim().to_string(), origin, actions);
        match self.store.try_admit(job, self.max_queue) {
            Ok(id) => {
                tracing::info!(job_id = %id, origin = %origin, url, "Job accepted");
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(origin = %origin, url, error = %e, "Submission rejected");
                Err(e.into())
            }
        }
    }
}
