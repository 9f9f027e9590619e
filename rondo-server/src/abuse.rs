//! Abuse controls: next-cooldown, peer reports, IP bans.
//!
//! Ban membership lives in the shared store; each instance keeps a
//! process-local cache of it so admission is an O(1) set lookup. A mutation
//! refreshes the mutating instance's cache directly and rides the `bans`
//! bus channel to every other instance, which invalidates its cache and
//! enforces the ban on its own connections.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::ServerEvent;
use crate::pairs::PairManager;
use crate::registry::Registry;
use crate::store::{Store, StoreResult};

pub const BANNED_IPS_KEY: &str = "banned_ips";
pub const BANS_CHANNEL: &str = "bans";

/// Minimum spacing between `next` clicks per connection.
pub const NEXT_COOLDOWN: Duration = Duration::from_millis(1000);

/// Reports from this many distinct records inside the window trigger a ban.
pub const AUTO_BAN_THRESHOLD: u64 = 5;

/// Report log window.
pub const REPORT_TTL_SECS: u64 = 24 * 60 * 60;

const MAX_REASON_BYTES: usize = 500;

pub fn ban_details_key(ip: IpAddr) -> String {
    format!("ban_details:{ip}")
}

pub fn reports_key(ip: IpAddr) -> String {
    format!("reports:{ip}")
}

/// True when a `next` at `now` is allowed given the previous one.
/// The cooldown is strictly per-connection and per-instance; a
/// reconnecting client gets a fresh id and a fresh clock.
pub fn cooldown_ok(last_next: Option<Instant>, now: Instant) -> bool {
    match last_next {
        Some(last) => now.duration_since(last) >= NEXT_COOLDOWN,
        None => true,
    }
}

/// One entry in an IP's report log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRecord {
    pub reporter_connection_id: String,
    pub reporter_ip: IpAddr,
    pub subject_ip: IpAddr,
    pub reason: String,
    pub timestamp: i64,
}

/// Ban-cache invalidation message on the `bans` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanNotice {
    pub op: BanOp,
    pub ip: IpAddr,
    pub reason: Option<String>,
    /// Instance that performed the mutation; it already applied the change
    /// locally, so it skips its own notice.
    pub origin: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanOp {
    Ban,
    Unban,
}

pub struct AbuseController {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    pairs: Arc<PairManager>,
    banned: RwLock<HashSet<IpAddr>>,
}

impl AbuseController {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>, pairs: Arc<PairManager>) -> Self {
        Self {
            store,
            registry,
            pairs,
            banned: RwLock::new(HashSet::new()),
        }
    }

    /// Load the ban set into the local cache. Called once at startup.
    pub async fn load_cache(&self) -> StoreResult<()> {
        let members = self.store.set_members(BANNED_IPS_KEY).await?;
        let parsed: HashSet<IpAddr> = members.iter().filter_map(|m| m.parse().ok()).collect();
        if parsed.len() != members.len() {
            tracing::warn!("Ignored unparseable entries in the ban set");
        }
        tracing::info!("Loaded {} banned IPs", parsed.len());
        *self.banned.write() = parsed;
        Ok(())
    }

    /// Admission check at the connection gateway.
    pub fn admission_allowed(&self, ip: IpAddr) -> bool {
        !self.banned.read().contains(&ip)
    }

    /// A client reported its current partner. Validation failures come back
    /// as an `error` event; a valid report is appended to the subject IP's
    /// log and acked, and crossing the threshold bans the IP.
    pub async fn report(&self, reporter: &str, peer: &str, reason: &str) -> StoreResult<()> {
        if reason.is_empty() || reason.len() > MAX_REASON_BYTES {
            self.registry
                .deliver(
                    reporter,
                    ServerEvent::Error {
                        message: "report reason must be 1-500 characters".into(),
                    },
                )
                .await;
            return Ok(());
        }
        if self.pairs.partner(reporter).await?.as_deref() != Some(peer) {
            self.registry
                .deliver(
                    reporter,
                    ServerEvent::Error {
                        message: "you can only report your current partner".into(),
                    },
                )
                .await;
            return Ok(());
        }
        let (Some(reporter_ip), Some(subject_ip)) = (
            self.registry.ip_of(reporter).await,
            self.registry.ip_of(peer).await,
        ) else {
            self.registry
                .deliver(
                    reporter,
                    ServerEvent::Error {
                        message: "report could not be recorded".into(),
                    },
                )
                .await;
            return Ok(());
        };

        let record = ReportRecord {
            reporter_connection_id: reporter.to_string(),
            reporter_ip,
            subject_ip,
            reason: reason.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        let key = reports_key(subject_ip);
        let json = serde_json::to_string(&record).unwrap_or_default();
        self.store.list_push(&key, &json).await?;
        self.store.expire(&key, REPORT_TTL_SECS).await?;

        let count = self.store.list_len(&key).await?;
        tracing::info!(%subject_ip, count, "Report recorded");
        if count >= AUTO_BAN_THRESHOLD {
            self.ban(subject_ip, "auto-ban: >=5 reports in 24h").await?;
        }

        self.registry
            .deliver(reporter, ServerEvent::ReportSubmitted { success: true })
            .await;
        Ok(())
    }

    /// Ban an IP: shared set + metadata, local cache and enforcement, then
    /// a bus notice so the rest of the fleet follows.
    pub async fn ban(&self, ip: IpAddr, reason: &str) -> StoreResult<()> {
        let ip_str = ip.to_string();
        self.store.set_add(BANNED_IPS_KEY, &ip_str).await?;
        let ts = chrono::Utc::now().timestamp().to_string();
        self.store
            .hash_set_multi(&ban_details_key(ip), &[("reason", reason), ("timestamp", &ts)])
            .await?;

        self.banned.write().insert(ip);
        self.enforce_local(ip, reason);
        self.publish_notice(BanOp::Ban, ip, Some(reason.to_string())).await;
        tracing::info!(%ip, %reason, "Banned");
        Ok(())
    }

    /// Lift a ban. Existing connections from the IP are unaffected.
    pub async fn unban(&self, ip: IpAddr) -> StoreResult<()> {
        let ip_str = ip.to_string();
        self.store.set_remove(BANNED_IPS_KEY, &ip_str).await?;
        self.store.delete(&ban_details_key(ip)).await?;

        self.banned.write().remove(&ip);
        self.publish_notice(BanOp::Unban, ip, None).await;
        tracing::info!(%ip, "Unbanned");
        Ok(())
    }

    /// Handle a notice from the `bans` channel.
    pub async fn apply_notice(&self, notice: BanNotice) {
        if notice.origin == self.registry.instance_id() {
            return;
        }
        match notice.op {
            BanOp::Ban => {
                self.banned.write().insert(notice.ip);
                let reason = notice.reason.as_deref().unwrap_or("banned");
                self.enforce_local(notice.ip, reason);
            }
            BanOp::Unban => {
                self.banned.write().remove(&notice.ip);
            }
        }
    }

    /// Tell every local connection from the IP it is banned. The gateway
    /// closes the socket after flushing the event.
    fn enforce_local(&self, ip: IpAddr, reason: &str) {
        for conn_id in self.registry.local_ids_with_ip(ip) {
            let delivered = self.registry.deliver_local(
                &conn_id,
                ServerEvent::Banned {
                    reason: reason.to_string(),
                },
            );
            if !delivered {
                tracing::debug!(%conn_id, "Banned connection already gone");
            }
        }
    }

    async fn publish_notice(&self, op: BanOp, ip: IpAddr, reason: Option<String>) {
        let notice = BanNotice {
            op,
            ip,
            reason,
            origin: self.registry.instance_id().to_string(),
        };
        let payload = match serde_json::to_string(&notice) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Failed to encode ban notice: {e}");
                return;
            }
        };
        if let Err(e) = self.store.publish(BANS_CHANNEL, &payload).await {
            tracing::warn!(%ip, "Ban notice publish failed: {e}");
        }
    }

    // ── Admin surface ──────────────────────────────────────────────────

    pub async fn reports_for(&self, ip: IpAddr) -> StoreResult<Vec<ReportRecord>> {
        let raw = self.store.list_range(&reports_key(ip)).await?;
        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }

    pub async fn clear_reports(&self, ip: IpAddr) -> StoreResult<()> {
        self.store.delete(&reports_key(ip)).await
    }

    /// Banned IPs with their metadata, for the admin surface.
    pub async fn ban_list(&self) -> StoreResult<Vec<(String, HashMap<String, String>)>> {
        let members = self.store.set_members(BANNED_IPS_KEY).await?;
        let mut out = Vec::with_capacity(members.len());
        for ip_str in members {
            let details = match ip_str.parse::<IpAddr>() {
                Ok(ip) => self.store.hash_get_all(&ban_details_key(ip)).await?,
                Err(_) => HashMap::new(),
            };
            out.push((ip_str, details));
        }
        Ok(out)
    }

    pub async fn ban_count(&self) -> StoreResult<u64> {
        Ok(self.store.set_members(BANNED_IPS_KEY).await?.len() as u64)
    }
}
