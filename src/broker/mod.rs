//! Upstream Broker: resolves and hands out a live connection to an STT or
//! LLM instance (spec.md §4.4).
//!
//! Grounded in `examples/original_source/.../service_discovery.py`:
//! `get_instances` DNS-resolves an internal hostname (shuffling the
//! candidates), caching the resolution for a short TTL with single-flight
//! de-duplication; `find_instance` tries candidates in order, bounded by
//! `max_trials`, classifying failures as at-capacity (never retried past
//! the first attempt that says so), timeout, or a hard miss.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::OrchestratorError;
use crate::metrics;

/// How a service's address is obtained: a fixed external URL (e.g. the LLM
/// endpoint, usually already load-balanced) or an internal hostname:port
/// that must be resolved and shuffled across replicas (spec.md §4.4).
#[derive(Debug, Clone)]
pub enum ServiceAddress {
    Fixed(String),
    Internal { scheme: String, host: String, port: u16 },
}

impl ServiceAddress {
    pub fn internal(url: &str) -> Result<Self, OrchestratorError> {
        let (scheme, rest) = url.split_once("://").ok_or_else(|| {
            OrchestratorError::Internal(anyhow::anyhow!("not a URL: {url}"))
        })?;
        let (host, port) = rest.split_once(':').ok_or_else(|| {
            OrchestratorError::Internal(anyhow::anyhow!("missing port in: {url}"))
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| OrchestratorError::Internal(anyhow::anyhow!("bad port in: {url}")))?;
        Ok(ServiceAddress::Internal {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

const RESOLVE_TTL: Duration = Duration::from_millis(500);

/// A TTL-cached, single-flight-de-duplicated DNS resolver (`async_ttl_cached`
/// wrapping `_resolve` in the source).
#[derive(Default)]
struct ResolveCache {
    entries: Mutex<HashMap<String, (Instant, Vec<String>)>>,
}

impl ResolveCache {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<String>, OrchestratorError> {
        let mut entries = self.entries.lock().await;
        if let Some((fetched_at, ips)) = entries.get(host) {
            if fetched_at.elapsed() < RESOLVE_TTL {
                return Ok(ips.clone());
            }
        }
        debug!(host, "resolving service hostname");
        let lookup_target = format!("{host}:{port}");
        let addrs: Vec<String> = lookup_host(&lookup_target)
            .await
            .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("DNS lookup failed for {host}: {e}")))?
            .map(|addr| addr.ip().to_string())
            .collect();
        entries.insert(host.to_string(), (Instant::now(), addrs.clone()));
        Ok(addrs)
    }
}

/// Resolve a service address into one or more candidate URLs, shuffled when
/// there's more than one (internal, load-balanced services only).
pub async fn get_instances(address: &ServiceAddress, cache: &ResolveCache) -> Result<Vec<String>, OrchestratorError> {
    match address {
        ServiceAddress::Fixed(url) => Ok(vec![url.clone()]),
        ServiceAddress::Internal { scheme, host, port } => {
            let mut ips = cache.resolve(host, *port).await?;
            ips.shuffle(&mut rand::rng());
            Ok(ips.into_iter().map(|ip| format!("{scheme}://{ip}:{port}")).collect())
        }
    }
}

/// A client that can attempt to connect/handshake, raising a typed error if
/// the instance refuses (at capacity) or never replies (timeout handled by
/// the caller, not this trait).
#[async_trait]
pub trait StartUp: Send {
    async fn start_up(&mut self) -> Result<(), OrchestratorError>;
}

/// Classification of a single connection attempt's failure, mirroring the
/// source's branch on `MissingServiceAtCapacity` vs. timeout vs. other.
enum AttemptFailure {
    AtCapacity,
    Timeout,
    Other(OrchestratorError),
}

fn classify(err: OrchestratorError) -> AttemptFailure {
    match err {
        OrchestratorError::UpstreamAtCapacity { .. } => AttemptFailure::AtCapacity,
        OrchestratorError::UpstreamTimeout { .. } => AttemptFailure::Timeout,
        other => AttemptFailure::Other(other),
    }
}

/// The broker itself: one DNS cache shared across every `find_instance` call
/// for the session pool's lifetime.
#[derive(Default)]
pub struct UpstreamBroker {
    cache: ResolveCache,
}

impl UpstreamBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Find a live instance of `service_name`, trying up to `max_trials`
    /// shuffled candidates with `timeout` per attempt.
    ///
    /// `client_factory` builds a not-yet-connected client for a candidate
    /// URL; `start_up` (via the `StartUp` trait) performs the handshake.
    pub async fn find_instance<S, F, Fut>(
        &self,
        service_name: &str,
        address: &ServiceAddress,
        timeout: Duration,
        max_trials: usize,
        client_factory: F,
    ) -> Result<S, OrchestratorError>
    where
        S: StartUp,
        F: Fn(String) -> Fut,
        Fut: Future<Output = S>,
    {
        let started = Instant::now();
        let instances = get_instances(address, &self.cache).await?;
        let mut trials_left = instances.len().min(max_trials);
        let is_stt = service_name == "stt";

        for instance in &instances {
            let mut client = client_factory(instance.clone()).await;
            debug!(service = service_name, instance, "trying to connect");
            let attempt_started = Instant::now();

            let outcome = tokio::time::timeout(timeout, client.start_up()).await;
            let result = match outcome {
                Ok(Ok(())) => {
                    let elapsed = attempt_started.elapsed().as_secs_f64();
                    if is_stt {
                        metrics::STT_PING_TIME.observe(elapsed);
                        metrics::STT_FIND_TIME.observe(started.elapsed().as_secs_f64());
                    }
                    info!(service = service_name, instance, elapsed_ms = elapsed * 1000.0, "connected");
                    return Ok(client);
                }
                Ok(Err(err)) => classify(err),
                Err(_) => AttemptFailure::Timeout,
            };

            trials_left -= 1;
            match result {
                AttemptFailure::AtCapacity => {
                    let elapsed = attempt_started.elapsed().as_secs_f64();
                    if is_stt {
                        metrics::STT_PING_TIME.observe(elapsed);
                    }
                    info!(service = service_name, instance, elapsed_ms = elapsed * 1000.0, "instance rejected us");
                    if trials_left == 0 {
                        metrics::SERVICE_MISSES.inc();
                        if is_stt {
                            metrics::STT_MISSES.inc();
                        }
                        return Err(OrchestratorError::UpstreamAtCapacity {
                            service: service_name.to_string(),
                        });
                    }
                }
                AttemptFailure::Timeout => {
                    metrics::HARD_SERVICE_MISSES.inc();
                    if is_stt {
                        metrics::STT_HARD_MISSES.inc();
                    }
                    warn!(service = service_name, instance, "instance did not reply in time");
                    if trials_left == 0 {
                        metrics::SERVICE_MISSES.inc();
                        if is_stt {
                            metrics::STT_MISSES.inc();
                        }
                        return Err(OrchestratorError::UpstreamTimeout {
                            service: service_name.to_string(),
                        });
                    }
                }
                AttemptFailure::Other(err) => {
                    metrics::HARD_SERVICE_MISSES.inc();
                    if is_stt {
                        metrics::STT_HARD_MISSES.inc();
                    }
                    error!(service = service_name, instance, error = %err, "unexpected error connecting");
                    if trials_left == 0 {
                        metrics::SERVICE_MISSES.inc();
                        if is_stt {
                            metrics::STT_MISSES.inc();
                        }
                        return Err(err);
                    }
                }
            }
        }
        Err(OrchestratorError::Internal(anyhow::anyhow!(
            "find_instance exhausted candidates without returning"
        )))
    }
}

/// Result of the `/health` probe (spec.md §6 "Health interface").
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthStatus {
    pub stt_up: bool,
    pub llm_up: bool,
    pub ok: bool,
}

impl UpstreamBroker {
    /// Resolve both upstreams without opening a full session; DNS/address
    /// resolution succeeding is treated as "up" (a lighter check than a full
    /// STT/LLM handshake per session, since this runs on every health poll).
    pub async fn health(&self, stt: &ServiceAddress, llm: &ServiceAddress) -> HealthStatus {
        let stt_up = get_instances(stt, &self.cache).await.map(|v| !v.is_empty()).unwrap_or(false);
        let llm_up = get_instances(llm, &self.cache).await.map(|v| !v.is_empty()).unwrap_or(false);
        HealthStatus { stt_up, llm_up, ok: stt_up && llm_up }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyClient {
        succeeds: bool,
    }

    #[async_trait]
    impl StartUp for FlakyClient {
        async fn start_up(&mut self) -> Result<(), OrchestratorError> {
            if self.succeeds {
                Ok(())
            } else {
                Err(OrchestratorError::UpstreamAtCapacity { service: "stt".into() })
            }
        }
    }

    #[tokio::test]
    async fn fixed_address_yields_single_candidate() {
        let cache = ResolveCache::default();
        let address = ServiceAddress::Fixed("http://llm.internal:9000".to_string());
        let instances = get_instances(&address, &cache).await.unwrap();
        assert_eq!(instances, vec!["http://llm.internal:9000".to_string()]);
    }

    #[tokio::test]
    async fn retries_across_candidates_until_one_accepts() {
        let broker = UpstreamBroker::new();
        let address = ServiceAddress::Fixed("http://llm.internal:9000".to_string());
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let client = broker
            .find_instance("llm", &address, Duration::from_millis(50), 3, move |_url| {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    FlakyClient { succeeds: n >= 1 }
                }
            })
            .await
            .unwrap();

        assert!(client.succeeds);
    }

    #[tokio::test]
    async fn at_capacity_with_single_candidate_surfaces_immediately() {
        let broker = UpstreamBroker::new();
        let address = ServiceAddress::Fixed("http://llm.internal:9000".to_string());

        let err = broker
            .find_instance("llm", &address, Duration::from_millis(50), 3, |_url| async {
                FlakyClient { succeeds: false }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::UpstreamAtCapacity { .. }));
    }

    #[tokio::test]
    async fn health_is_ok_when_both_upstreams_resolve() {
        let broker = UpstreamBroker::new();
        let stt = ServiceAddress::Fixed("ws://stt.internal:8090".to_string());
        let llm = ServiceAddress::Fixed("http://llm.internal:9000".to_string());
        let status = broker.health(&stt, &llm).await;
        assert!(status.ok);
    }
}
