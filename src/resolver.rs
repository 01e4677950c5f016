//! Reverse DNS for source IPs.
//!
//! Lookups are best-effort: a timeout or missing PTR record leaves the IP
//! unresolved and is recorded, never fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::ResolutionError;

/// Async hostname lookup for one IP.
pub trait HostnameLookup: Send + Sync + 'static {
    fn lookup(&self, ip: IpAddr) -> impl Future<Output = Result<String, ResolutionError>> + Send;
}

/// PTR lookups through the system resolver configuration.
#[derive(Clone)]
pub struct ReverseDnsLookup {
    resolver: TokioAsyncResolver,
}

impl ReverseDnsLookup {
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { resolver })
    }
}

impl HostnameLookup for ReverseDnsLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<String, ResolutionError> {
        log::debug!("Reverse lookup for {ip}");
        match self.resolver.reverse_lookup(ip).await {
            Ok(response) => response
                .iter()
                .map(|name| name.to_string().trim_end_matches('.').to_string())
                .find(|name| !name.is_empty())
                .ok_or(ResolutionError::NoRecord { ip }),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Err(ResolutionError::NoRecord { ip }),
                _ => Err(ResolutionError::Lookup {
                    ip,
                    message: e.to_string(),
                }),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverSettings {
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub hostnames: BTreeMap<IpAddr, String>,
    pub unresolved: BTreeMap<IpAddr, ResolutionError>,
}

impl Resolution {
    /// Every IP unresolved for the same reason, used when no resolver exists.
    pub fn all_failed<F>(ips: &BTreeSet<IpAddr>, error: F) -> Self
    where
        F: Fn(IpAddr) -> ResolutionError,
    {
        Self {
            hostnames: BTreeMap::new(),
            unresolved: ips.iter().map(|ip| (*ip, error(*ip))).collect(),
        }
    }
}

/// Resolve every IP with at most `settings.concurrency` lookups in flight.
pub async fn resolve_all<L: HostnameLookup>(
    lookup: Arc<L>,
    ips: &BTreeSet<IpAddr>,
    settings: ResolverSettings,
) -> Resolution {
    let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for &ip in ips {
        let lookup = Arc::clone(&lookup);
        let permits = Arc::clone(&permits);
        let timeout = settings.timeout;
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let result = match tokio::time::timeout(timeout, lookup.lookup(ip)).await {
                Ok(result) => result,
                Err(_) => Err(ResolutionError::Timeout { ip }),
            };
            (ip, result)
        });
    }

    let mut resolution = Resolution::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((ip, Ok(hostname))) => {
                log::debug!("Resolved {ip} to {hostname}");
                resolution.hostnames.insert(ip, hostname);
            }
            Ok((ip, Err(e))) => {
                log::info!("{e}");
                resolution.unresolved.insert(ip, e);
            }
            Err(e) => log::warn!("Reverse lookup task failed: {e}"),
        }
    }
    resolution
}


#[cfg(test)]
mod tests {
    use super::fixtures::StaticLookup;
    use super::*;

    fn ips(list: &[&str]) -> BTreeSet<IpAddr> {
        list.iter().map(|ip| ip.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_resolve_all_collects_answers_and_failures() {
        let lookup = StaticLookup::default()
            .with("192.0.2.1", "mail-a.google.com")
            .with("192.0.2.2", "o1.sendgrid.net");
        let targets = ips(&["192.0.2.1", "192.0.2.2", "192.0.2.3"]);

        let resolution = resolve_all(Arc::new(lookup), &targets, ResolverSettings::default()).await;

        assert_eq!(resolution.hostnames.len(), 2);
        assert_eq!(
            resolution.hostnames[&"192.0.2.1".parse::<IpAddr>().unwrap()],
            "mail-a.google.com"
        );
        let missing: IpAddr = "192.0.2.3".parse().unwrap();
        assert_eq!(
            resolution.unresolved[&missing],
            ResolutionError::NoRecord { ip: missing }
        );
    }

    #[tokio::test]
    async fn test_slow_lookup_times_out() {
        let slow: IpAddr = "198.51.100.7".parse().unwrap();
        let mut lookup = StaticLookup::default().with("198.51.100.7", "never.example.net");
        lookup.slow.insert(slow);
        let settings = ResolverSettings {
            timeout: Duration::from_millis(50),
            concurrency: 1,
        };

        let resolution = resolve_all(Arc::new(lookup), &ips(&["198.51.100.7"]), settings).await;

        assert!(resolution.hostnames.is_empty());
        assert_eq!(
            resolution.unresolved[&slow],
            ResolutionError::Timeout { ip: slow }
        );
    }

    #[tokio::test]
    async fn test_empty_input() {
        let resolution = resolve_all(
            Arc::new(StaticLookup::default()),
            &BTreeSet::new(),
            ResolverSettings::default(),
        )
        .await;
        assert_eq!(resolution, Resolution::default());
    }

    #[test]
    fn test_all_failed() {
        let targets = ips(&["192.0.2.1", "192.0.2.2"]);
        let resolution = Resolution::all_failed(&targets, |ip| ResolutionError::Lookup {
            ip,
            message: "no resolver".to_string(),
        });
        assert_eq!(resolution.unresolved.len(), 2);
    }
}
