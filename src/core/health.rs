//! System-health snapshot normalization.
//!
//! The server publishes periodic health payloads in two encodings that carry the same
//! information: a compact one (`t`, `o`, `s`, `sys`, `u`) and a verbose one (`timestamp`,
//! `overall`, `services`, `system`, `uptime`). Both decode into [`HealthSnapshot`], and two
//! payloads describing the same server state produce equal snapshots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::types::{SyncError, SyncResult};

/// Health status shared by services and the overall rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }
}

impl From<String> for HealthStatus {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "healthy" | "ok" | "up" => HealthStatus::Healthy,
            "degraded" | "warning" | "warn" => HealthStatus::Degraded,
            "unhealthy" | "down" | "error" | "critical" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

/// Services the canonical snapshot knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceId {
    Database,
    Cache,
    Queue,
    Communication,
    Video,
    Logging,
}

impl ServiceId {
    pub const ALL: [ServiceId; 6] = [
        ServiceId::Database,
        ServiceId::Cache,
        ServiceId::Queue,
        ServiceId::Communication,
        ServiceId::Video,
        ServiceId::Logging,
    ];

    /// Map a wire identifier to a known service; unknown identifiers yield `None`.
    pub fn from_wire(raw: &str) -> Option<Self> {
        Self::resolve(raw).map(|(id, _)| id)
    }

    /// Service plus alias precedence: `0` is the canonical name, then aliases in fixed order.
    fn resolve(raw: &str) -> Option<(Self, u8)> {
        let resolved = match raw.to_ascii_lowercase().as_str() {
            "database" => (ServiceId::Database, 0),
            "db" => (ServiceId::Database, 1),
            "cache" => (ServiceId::Cache, 0),
            "redis" => (ServiceId::Cache, 1),
            "queue" => (ServiceId::Queue, 0),
            "jobs" => (ServiceId::Queue, 1),
            "communication" => (ServiceId::Communication, 0),
            "notifications" => (ServiceId::Communication, 1),
            "email" => (ServiceId::Communication, 2),
            "sms" => (ServiceId::Communication, 3),
            "video" => (ServiceId::Video, 0),
            "logging" => (ServiceId::Logging, 0),
            "logs" => (ServiceId::Logging, 1),
            _ => return None,
        };
        Some(resolved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceId::Database => "database",
            ServiceId::Cache => "cache",
            ServiceId::Queue => "queue",
            ServiceId::Communication => "communication",
            ServiceId::Video => "video",
            ServiceId::Logging => "logging",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub timestamp: String,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

/// One slot per known service; unknown services never make it into the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceHealthMap {
    pub database: Option<ServiceHealth>,
    pub cache: Option<ServiceHealth>,
    pub queue: Option<ServiceHealth>,
    pub communication: Option<ServiceHealth>,
    pub video: Option<ServiceHealth>,
    pub logging: Option<ServiceHealth>,
}

impl ServiceHealthMap {
    pub fn get(&self, id: ServiceId) -> Option<&ServiceHealth> {
        self.slot(id).as_ref()
    }

    fn slot(&self, id: ServiceId) -> &Option<ServiceHealth> {
        match id {
            ServiceId::Database => &self.database,
            ServiceId::Cache => &self.cache,
            ServiceId::Queue => &self.queue,
            ServiceId::Communication => &self.communication,
            ServiceId::Video => &self.video,
            ServiceId::Logging => &self.logging,
        }
    }

    fn slot_mut(&mut self, id: ServiceId) -> &mut Option<ServiceHealth> {
        match id {
            ServiceId::Database => &mut self.database,
            ServiceId::Cache => &mut self.cache,
            ServiceId::Queue => &mut self.queue,
            ServiceId::Communication => &mut self.communication,
            ServiceId::Video => &mut self.video,
            ServiceId::Logging => &mut self.logging,
        }
    }

    fn worst_status(&self) -> Option<HealthStatus> {
        ServiceId::ALL
            .iter()
            .filter_map(|id| self.get(*id).map(|svc| svc.status))
            .max_by_key(|status| status.severity())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub active_connections: u64,
    pub request_rate: f64,
    pub error_rate: f64,
}

/// Canonical, encoding-agnostic health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: String,
    pub overall: HealthStatus,
    pub services: ServiceHealthMap,
    pub system: SystemMetrics,
    pub uptime_seconds: u64,
}

/// Single-service delta pushed between full snapshots.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUpdate {
    #[serde(alias = "service", alias = "name")]
    pub id: String,
    pub status: HealthStatus,
    #[serde(default, alias = "responseTime")]
    pub response_time_ms: Option<f64>,
    pub timestamp: WireTimestamp,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Text(String),
    Millis(i64),
}

impl WireTimestamp {
    fn canonical(&self) -> String {
        match self {
            WireTimestamp::Text(text) => text.clone(),
            WireTimestamp::Millis(ms) => ms.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireService {
    status: HealthStatus,
    timestamp: WireTimestamp,
    #[serde(default, rename = "responseTime", alias = "responseTimeMs")]
    response_time: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSystem {
    #[serde(default, alias = "cpuUsage")]
    cpu: f64,
    #[serde(default, alias = "memoryUsage")]
    memory: f64,
    #[serde(default)]
    active_connections: f64,
    #[serde(default)]
    request_rate: f64,
    #[serde(default)]
    error_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompactHealth {
    t: WireTimestamp,
    o: HealthStatus,
    #[serde(default)]
    s: HashMap<String, WireService>,
    #[serde(default)]
    sys: WireSystem,
    #[serde(default)]
    u: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerboseHealth {
    timestamp: WireTimestamp,
    overall: HealthStatus,
    #[serde(default)]
    services: HashMap<String, WireService>,
    #[serde(default)]
    system: WireSystem,
    #[serde(default)]
    uptime: f64,
}

/// Either wire encoding of a full health payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireHealthPayload {
    Compact(CompactHealth),
    Verbose(VerboseHealth),
}

impl WireHealthPayload {
    pub fn into_snapshot(self) -> HealthSnapshot {
        match self {
            WireHealthPayload::Compact(c) => build_snapshot(c.t, c.o, c.s, c.sys, c.u),
            WireHealthPayload::Verbose(v) => {
                build_snapshot(v.timestamp, v.overall, v.services, v.system, v.uptime)
            }
        }
    }
}

fn whole(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

fn build_snapshot(
    timestamp: WireTimestamp,
    overall: HealthStatus,
    services: HashMap<String, WireService>,
    system: WireSystem,
    uptime: f64,
) -> HealthSnapshot {
    // Several wire names share a slot; the lowest (precedence, name) wins so the result never
    // depends on map iteration order.
    let mut chosen: HashMap<ServiceId, (u8, String, WireService)> = HashMap::new();
    for (name, svc) in services {
        let Some((id, rank)) = ServiceId::resolve(&name) else {
            tracing::debug!(service = %name, "ignoring unknown health service");
            continue;
        };
        let shadowed = chosen.get(&id).is_some_and(|(best_rank, best_name, _)| {
            (*best_rank, best_name.as_str()) <= (rank, name.as_str())
        });
        if shadowed {
            tracing::debug!(service = %name, "ignoring shadowed health service alias");
            continue;
        }
        chosen.insert(id, (rank, name, svc));
    }

    let mut map = ServiceHealthMap::default();
    for (id, (_, _, svc)) in chosen {
        *map.slot_mut(id) = Some(ServiceHealth {
            status: svc.status,
            timestamp: svc.timestamp.canonical(),
            response_time_ms: svc.response_time.map(whole),
            error: svc.error,
        });
    }

    HealthSnapshot {
        timestamp: timestamp.canonical(),
        overall,
        services: map,
        system: SystemMetrics {
            cpu_percent: system.cpu,
            memory_percent: system.memory,
            active_connections: whole(system.active_connections),
            request_rate: system.request_rate,
            error_rate: system.error_rate,
        },
        uptime_seconds: whole(uptime),
    }
}

/// Decode either wire encoding into the canonical snapshot.
pub fn normalize(payload: &[u8]) -> SyncResult<HealthSnapshot> {
    let wire: WireHealthPayload = sonic_rs::from_slice(payload)
        .map_err(|err| SyncError::ParseFailed(format!("health payload: {err}")))?;
    Ok(wire.into_snapshot())
}

/// Apply a single-service delta in place.
///
/// Returns `false` (and leaves the snapshot untouched) for unknown service ids. An absent
/// response time keeps the previous measurement; `overall` is recomputed as the worst
/// known service status.
pub fn merge_service_update(snapshot: &mut HealthSnapshot, update: &ServiceUpdate) -> bool {
    let Some(id) = ServiceId::from_wire(&update.id) else {
        tracing::debug!(service = %update.id, "ignoring update for unknown health service");
        return false;
    };

    let slot = snapshot.services.slot_mut(id);
    let previous_rt = slot.as_ref().and_then(|svc| svc.response_time_ms);
    let timestamp = update.timestamp.canonical();
    *slot = Some(ServiceHealth {
        status: update.status,
        timestamp: timestamp.clone(),
        response_time_ms: update.response_time_ms.map(whole).or(previous_rt),
        error: update.error.clone(),
    });

    if let Some(worst) = snapshot.services.worst_status() {
        snapshot.overall = worst;
    }
    snapshot.timestamp = timestamp;
    true
}
