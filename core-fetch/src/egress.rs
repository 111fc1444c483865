//! # Egress Pool
//!
//! Set of outbound network identities (the direct route plus configured
//! proxies) shared by every download worker.
//!
//! ## Selection
//!
//! [`EgressPool::acquire`] picks, among eligible identities, the one with the
//! fewest consecutive failures; ties go to the least recently used. A proxy
//! that reaches `max_failures` consecutive failures is disabled for the
//! cool-down interval and its counter is reset. Successes decay the counter
//! by one.
//!
//! The direct route is the fallback and is never disabled by failures; its
//! counter saturates at `max_failures` so healthy proxies are still
//! preferred. Only an administrator can switch it off, so `acquire` fails
//! with [`FetchError::NoEligibleIdentity`] only when the operator has
//! removed the last route.
//!
//! All state lives behind one mutex; no method awaits while holding it.

use bridge_traits::{Clock, EgressRoute};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core_runtime::events::{CoreEvent, EgressEvent, EventBus};
use core_runtime::logging::mask_proxy_credentials;
use core_runtime::EngineConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{FetchError, Result};

pub const DIRECT_IDENTITY_ID: &str = "direct";

const PROXY_SCHEMES: &[&str] = &["http", "https", "socks4", "socks5", "socks5h"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Direct,
    Proxy,
}

/// One outbound route and its health.
#[derive(Debug, Clone)]
pub struct EgressIdentity {
    pub id: String,
    pub kind: IdentityKind,
    pub route: EgressRoute,
    pub consecutive_failures: u32,
    pub disabled_until: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    /// Switched off by an administrator, independent of failures.
    pub admin_disabled: bool,
    total_successes: u64,
    total_failures: u64,
    use_seq: u64,
}

impl EgressIdentity {
    fn new(id: impl Into<String>, route: EgressRoute) -> Self {
        let kind = match route {
            EgressRoute::Direct => IdentityKind::Direct,
            EgressRoute::Proxy { .. } => IdentityKind::Proxy,
        };
        Self {
            id: id.into(),
            kind,
            route,
            consecutive_failures: 0,
            disabled_until: None,
            last_used: None,
            admin_disabled: false,
            total_successes: 0,
            total_failures: 0,
            use_seq: 0,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.admin_disabled && self.disabled_until.map_or(true, |until| until <= now)
    }

    /// Route for logs, with proxy credentials masked.
    pub fn display_route(&self) -> String {
        match &self.route {
            EgressRoute::Direct => DIRECT_IDENTITY_ID.to_string(),
            EgressRoute::Proxy { url } => mask_proxy_credentials(url),
        }
    }
}

/// Per-identity counters for the admin status view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityStats {
    pub id: String,
    pub kind: IdentityKind,
    pub route: String,
    pub eligible: bool,
    pub admin_disabled: bool,
    pub consecutive_failures: u32,
    pub disabled_until: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
}

struct PoolState {
    identities: Vec<EgressIdentity>,
    next_seq: u64,
}

pub struct EgressPool {
    state: Mutex<PoolState>,
    max_failures: u32,
    cool_down: Duration,
    clock: Arc<dyn Clock>,
    event_bus: Option<Arc<EventBus>>,
}

impl EgressPool {
    /// Pool over the given routes. Identity ids are `direct` and `proxy-N`.
    pub fn new(
        routes: impl IntoIterator<Item = EgressRoute>,
        max_failures: u32,
        cool_down: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut proxy_index = 0;
        let identities = routes
            .into_iter()
            .map(|route| match route {
                EgressRoute::Direct => EgressIdentity::new(DIRECT_IDENTITY_ID, route),
                EgressRoute::Proxy { .. } => {
                    proxy_index += 1;
                    EgressIdentity::new(format!("proxy-{}", proxy_index), route)
                }
            })
            .collect();

        Self {
            state: Mutex::new(PoolState {
                identities,
                next_seq: 0,
            }),
            max_failures: max_failures.max(1),
            cool_down,
            clock,
            event_bus: None,
        }
    }

    /// Direct route plus every configured proxy, validated.
    pub fn from_config(config: &EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut routes = vec![EgressRoute::Direct];
        for proxy in &config.proxies {
            routes.push(parse_proxy(proxy)?);
        }
        info!(
            identities = routes.len(),
            max_failures = config.max_proxy_failures,
            "Egress pool configured"
        );
        Ok(Self::new(
            routes,
            config.max_proxy_failures,
            config.proxy_rotation_interval,
            clock,
        ))
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn emit(&self, event: EgressEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(CoreEvent::Egress(event));
        }
    }

    /// Pick the healthiest eligible identity and mark it used.
    pub fn acquire(&self) -> Result<EgressIdentity> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;

        let chosen = state
            .identities
            .iter()
            .enumerate()
            .filter(|(_, identity)| identity.is_eligible(now))
            .min_by_key(|(_, identity)| (identity.consecutive_failures, identity.use_seq))
            .map(|(index, _)| index);

        let Some(index) = chosen else {
            drop(state);
            warn!("No eligible egress identity");
            self.emit(EgressEvent::Exhausted);
            return Err(FetchError::NoEligibleIdentity);
        };

        let identity = &mut state.identities[index];
        identity.use_seq = seq;
        identity.last_used = Some(now);
        debug!(identity = %identity.id, "Egress identity acquired");
        Ok(identity.clone())
    }

    /// Count a failure. Returns `true` when this failure disabled the identity.
    pub fn report_failure(&self, id: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let identity = find_mut(&mut state.identities, id)?;

        identity.total_failures += 1;
        if identity.kind == IdentityKind::Direct {
            identity.consecutive_failures =
                (identity.consecutive_failures + 1).min(self.max_failures);
            debug!(
                failures = identity.consecutive_failures,
                "Direct route failure recorded"
            );
            return Ok(false);
        }

        identity.consecutive_failures += 1;
        if identity.consecutive_failures < self.max_failures {
            debug!(
                identity = %identity.id,
                failures = identity.consecutive_failures,
                "Egress failure recorded"
            );
            return Ok(false);
        }

        let cool_down =
            ChronoDuration::from_std(self.cool_down).unwrap_or_else(|_| ChronoDuration::days(365));
        let until = now.checked_add_signed(cool_down).unwrap_or(now);
        identity.disabled_until = Some(until);
        identity.consecutive_failures = 0;
        let identity_id = identity.id.clone();
        drop(state);

        warn!(identity = %identity_id, until = %until, "Egress identity disabled");
        self.emit(EgressEvent::IdentityDisabled {
            identity_id,
            until: until.timestamp(),
        });
        Ok(true)
    }

    pub fn report_success(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let identity = find_mut(&mut state.identities, id)?;
        identity.total_successes += 1;
        identity.consecutive_failures = identity.consecutive_failures.saturating_sub(1);
        Ok(())
    }

    /// Re-admit identities whose cool-down has expired. Returns how many.
    pub fn rotate(&self) -> usize {
        let now = self.clock.now();
        let readmitted: Vec<String> = {
            let mut state = self.state.lock();
            state
                .identities
                .iter_mut()
                .filter(|identity| matches!(identity.disabled_until, Some(until) if until <= now))
                .map(|identity| {
                    identity.disabled_until = None;
                    identity.id.clone()
                })
                .collect()
        };

        for identity_id in &readmitted {
            info!(identity = %identity_id, "Egress identity re-admitted");
            self.emit(EgressEvent::IdentityReadmitted {
                identity_id: identity_id.clone(),
            });
        }
        readmitted.len()
    }

    /// Run [`rotate`](Self::rotate) every `interval` until cancelled.
    pub fn spawn_rotation(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.rotate();
                    }
                }
            }
            debug!("Egress rotation stopped");
        })
    }

    /// Administrative switch. Enabling also clears any cool-down.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        let identity = find_mut(&mut state.identities, id)?;
        identity.admin_disabled = !enabled;
        if enabled {
            identity.disabled_until = None;
            identity.consecutive_failures = 0;
        }
        info!(identity = %id, enabled, "Egress identity toggled");
        Ok(())
    }

    pub fn eligible_count(&self) -> usize {
        let now = self.clock.now();
        self.state
            .lock()
            .identities
            .iter()
            .filter(|identity| identity.is_eligible(now))
            .count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Vec<IdentityStats> {
        let now = self.clock.now();
        self.state
            .lock()
            .identities
            .iter()
            .map(|identity| IdentityStats {
                id: identity.id.clone(),
                kind: identity.kind,
                route: identity.display_route(),
                eligible: identity.is_eligible(now),
                admin_disabled: identity.admin_disabled,
                consecutive_failures: identity.consecutive_failures,
                disabled_until: identity.disabled_until,
                total_successes: identity.total_successes,
                total_failures: identity.total_failures,
            })
            .collect()
    }
}

fn find_mut<'a>(identities: &'a mut [EgressIdentity], id: &str) -> Result<&'a mut EgressIdentity> {
    identities
        .iter_mut()
        .find(|identity| identity.id == id)
        .ok_or_else(|| FetchError::IdentityNotFound(id.to_string()))
}

/// Parse one proxy entry: `scheme://[user:pass@]host:port` or bare `host:port`
/// (treated as HTTP).
pub fn parse_proxy(raw: &str) -> Result<EgressRoute> {
    let trimmed = raw.trim();
    let invalid = |reason: &str| FetchError::InvalidProxy {
        proxy: mask_proxy_credentials(trimmed),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("empty entry"));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let url = Url::parse(&candidate).map_err(|e| invalid(&e.to_string()))?;
    if !PROXY_SCHEMES.contains(&url.scheme()) {
        return Err(invalid("unsupported scheme"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    if url.port_or_known_default().is_none() {
        return Err(invalid("missing port"));
    }

    Ok(EgressRoute::Proxy {
        url: candidate.trim_end_matches('/').to_string(),
    })
}

/// Parse a comma or newline separated proxy list, skipping blanks.
pub fn parse_proxy_list(raw: &str) -> Result<Vec<EgressRoute>> {
    raw.split(|c| c == ',' || c == '\n')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_proxy)
        .collect()
}
