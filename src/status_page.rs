//! Status page projection and access control.
//!
//! A status page is a read-only view over an ordered subset of a tenant's
//! endpoints. Private pages are gated by a password; a correct password
//! yields a short-lived token scoped to that page's slug.

use crate::db::{CheckStatus, DbError, HealthCheckResult, StatusPage, Store};
use crate::scheduler::UptimeAggregator;

use chrono::{DateTime, Utc};
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

/// Slots in the recent-history strip.
pub const HISTORY_SLOTS: usize = 20;
const UPTIME_WINDOW_HOURS: u32 = 24;
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum StatusPageError {
    #[error("status page not found")]
    NotFound,
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
    #[error("endpoint {0} does not exist")]
    UnknownEndpoint(i64),
    #[error("slug is already taken")]
    SlugTaken,
    #[error("status page is public")]
    NotLocked,
    #[error("invalid password")]
    InvalidPassword,
    #[error("store error: {0}")]
    Store(DbError),
}

impl From<DbError> for StatusPageError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => StatusPageError::NotFound,
            DbError::Conflict(_) => StatusPageError::SlugTaken,
            other => StatusPageError::Store(other),
        }
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> StatusPageError {
    StatusPageError::Invalid {
        field,
        message: message.into(),
    }
}

fn slug_pattern() -> &'static Regex {
    static SLUG: OnceLock<Regex> = OnceLock::new();
    SLUG.get_or_init(|| Regex::new(r"^[a-z0-9-]{3,64}$").expect("static slug pattern"))
}

/// PBKDF2 scheme tag at the front of every stored hash.
const PASSWORD_SCHEME: &str = "pbkdf2-sha256";
#[cfg(not(test))]
const PBKDF2_ROUNDS: u32 = 210_000;
#[cfg(test)]
const PBKDF2_ROUNDS: u32 = 1_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// PBKDF2-HMAC-SHA256, stored as `pbkdf2-sha256$rounds$salt$hash` with hex
/// salt and hash. The round count travels with the hash.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = derive(password, &salt, PBKDF2_ROUNDS);
    format!(
        "{}${}${}${}",
        PASSWORD_SCHEME,
        PBKDF2_ROUNDS,
        hex::encode(salt),
        hex::encode(hash)
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(rounds), Some(salt), Some(expected), None) =
        (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if scheme != PASSWORD_SCHEME {
        return false;
    }
    let (Ok(rounds), Ok(salt), Ok(expected)) = (rounds.parse::<u32>(), hex::decode(salt), hex::decode(expected)) else {
        return false;
    };
    if rounds == 0 || expected.len() != HASH_LEN {
        return false;
    }
    constant_time_compare(&derive(password, &salt, rounds), &expected)
}

fn derive(password: &str, salt: &[u8], rounds: u32) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut out);
    out
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Issued unlock token.
#[derive(Debug, Clone, Serialize)]
pub struct UnlockGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

struct Session {
    slug: String,
    created_at: Instant,
}

/// In-memory table of unlock tokens.
#[derive(Clone)]
pub struct UnlockSessions {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    ttl: Duration,
}

impl UnlockSessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn issue(&self, slug: &str) -> UnlockGrant {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        self.sessions.write().await.insert(
            token.clone(),
            Session {
                slug: slug.to_string(),
                created_at: Instant::now(),
            },
        );

        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        UnlockGrant {
            token,
            expires_at: Utc::now() + ttl,
        }
    }

    /// True when `token` is live and scoped to `slug`. Expired tokens are dropped.
    pub async fn validate(&self, token: &str, slug: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let expired = match sessions.get(token) {
            Some(session) if session.created_at.elapsed() >= self.ttl => true,
            Some(session) => return session.slug == slug,
            None => return false,
        };
        if expired {
            sessions.remove(token);
        }
        false
    }

    pub async fn revoke_slug(&self, slug: &str) {
        self.sessions.write().await.retain(|_, s| s.slug != slug);
    }

    /// Remove expired sessions.
    pub async fn cleanup(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.created_at.elapsed() < self.ttl);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Current state shown for a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayStatus {
    Unknown,
    Up,
    Degraded,
    Down,
}

impl From<CheckStatus> for DisplayStatus {
    fn from(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Up => DisplayStatus::Up,
            CheckStatus::Degraded => DisplayStatus::Degraded,
            CheckStatus::Down => DisplayStatus::Down,
        }
    }
}

/// One cell of the history strip.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HistorySlot {
    Empty,
    Up { checked_at: DateTime<Utc> },
    Degraded { checked_at: DateTime<Utc> },
    Down { checked_at: DateTime<Utc> },
}

impl From<&HealthCheckResult> for HistorySlot {
    fn from(check: &HealthCheckResult) -> Self {
        let checked_at = check.checked_at;
        match check.status {
            CheckStatus::Up => HistorySlot::Up { checked_at },
            CheckStatus::Degraded => HistorySlot::Degraded { checked_at },
            CheckStatus::Down => HistorySlot::Down { checked_at },
        }
    }
}

/// Last `slots` checks oldest to newest, left-padded with `Empty`.
pub fn history_strip(checks: &[HealthCheckResult], slots: usize) -> Vec<HistorySlot> {
    let tail = &checks[checks.len().saturating_sub(slots)..];
    let mut strip = vec![HistorySlot::Empty; slots - tail.len()];
    strip.extend(tail.iter().map(HistorySlot::from));
    strip
}

/// Current status from the latest check and outage state. An `up` check
/// inside a still-open outage shows as degraded until the outage closes.
pub fn current_status(latest: Option<&HealthCheckResult>, in_outage: bool) -> DisplayStatus {
    match latest {
        None if in_outage => DisplayStatus::Down,
        None => DisplayStatus::Unknown,
        Some(check) if in_outage && check.status == CheckStatus::Up => DisplayStatus::Degraded,
        Some(check) => check.status.into(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorView {
    pub endpoint_id: i64,
    pub name: String,
    pub status: DisplayStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<i64>,
    pub in_outage: bool,
    pub outage_since: Option<DateTime<Utc>>,
    pub uptime_24h: f64,
    pub history: Vec<HistorySlot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageContent {
    pub slug: String,
    pub title: String,
    pub description: String,
    pub overall: DisplayStatus,
    pub monitors: Vec<MonitorView>,
}

/// Public read model of a status page.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PageView {
    Locked {
        slug: String,
        title: String,
        description: String,
    },
    Unlocked(PageContent),
}

/// Fields for a new status page.
#[derive(Debug, Clone, Deserialize)]
pub struct NewStatusPage {
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_public")]
    pub is_public: bool,
    pub password: Option<String>,
    #[serde(default)]
    pub endpoint_ids: Vec<i64>,
}

fn default_public() -> bool {
    true
}

pub struct StatusPageProjector {
    store: Arc<Store>,
    aggregator: Arc<UptimeAggregator>,
    sessions: UnlockSessions,
}

impl StatusPageProjector {
    pub fn new(store: Arc<Store>, aggregator: Arc<UptimeAggregator>, sessions: UnlockSessions) -> Self {
        Self {
            store,
            aggregator,
            sessions,
        }
    }

    /// Periodically drop expired unlock tokens.
    pub fn start_sweeper(self: &Arc<Self>) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let removed = sessions.cleanup().await;
                if removed > 0 {
                    tracing::debug!("StatusPage: swept {} expired unlock tokens", removed);
                }
            }
        });
    }

    pub fn create(&self, tenant_id: &str, new: NewStatusPage) -> Result<StatusPage, StatusPageError> {
        let slug = new.slug.trim().to_string();
        if !slug_pattern().is_match(&slug) {
            return Err(invalid("slug", "must be 3-64 characters of a-z, 0-9 or '-'"));
        }
        let title = new.title.trim().to_string();
        if title.is_empty() {
            return Err(invalid("title", "must not be empty"));
        }

        let password_hash = match (new.is_public, new.password.as_deref()) {
            (_, Some(pw)) if !pw.is_empty() => Some(hash_password(pw)),
            (false, _) => return Err(invalid("password", "required for a private page")),
            (true, _) => None,
        };

        let mut seen = HashSet::new();
        for &endpoint_id in &new.endpoint_ids {
            if !seen.insert(endpoint_id) {
                return Err(invalid("endpoint_ids", format!("endpoint {} listed twice", endpoint_id)));
            }
            match self.store.get_endpoint(tenant_id, endpoint_id) {
                Ok(_) => {}
                Err(DbError::NotFound) => return Err(StatusPageError::UnknownEndpoint(endpoint_id)),
                Err(e) => return Err(e.into()),
            }
        }

        let mut page = StatusPage {
            id: 0,
            tenant_id: tenant_id.to_string(),
            slug,
            title,
            description: new.description.trim().to_string(),
            is_public: new.is_public,
            password_hash,
            endpoint_ids: new.endpoint_ids,
        };
        self.store.add_status_page(&mut page)?;
        tracing::info!(tenant = %tenant_id, slug = %page.slug, "StatusPage: created");
        Ok(page)
    }

    pub fn list(&self, tenant_id: &str) -> Result<Vec<StatusPage>, StatusPageError> {
        Ok(self.store.list_status_pages(tenant_id)?)
    }

    pub async fn delete(&self, tenant_id: &str, slug: &str) -> Result<(), StatusPageError> {
        self.store.delete_status_page(tenant_id, slug)?;
        self.sessions.revoke_slug(slug).await;
        Ok(())
    }

    /// Exchange a page password for an unlock token.
    pub async fn unlock(&self, slug: &str, password: &str) -> Result<UnlockGrant, StatusPageError> {
        let page = self.store.get_status_page(slug)?.ok_or(StatusPageError::NotFound)?;
        if page.is_public {
            return Err(StatusPageError::NotLocked);
        }
        match page.password_hash.as_deref() {
            Some(stored) if verify_password(password, stored) => Ok(self.sessions.issue(slug).await),
            _ => {
                tracing::info!(slug = %slug, "StatusPage: rejected unlock attempt");
                Err(StatusPageError::InvalidPassword)
            }
        }
    }

    /// Public view. Private pages without a valid token come back locked.
    pub async fn view(&self, slug: &str, token: Option<&str>, now: DateTime<Utc>) -> Result<PageView, StatusPageError> {
        let page = self.store.get_status_page(slug)?.ok_or(StatusPageError::NotFound)?;

        if !page.is_public {
            let unlocked = match token {
                Some(token) => self.sessions.validate(token, &page.slug).await,
                None => false,
            };
            if !unlocked {
                return Ok(PageView::Locked {
                    slug: page.slug,
                    title: page.title,
                    description: page.description,
                });
            }
        }

        let mut monitors = Vec::with_capacity(page.endpoint_ids.len());
        for &endpoint_id in &page.endpoint_ids {
            if let Some(view) = self.monitor_view(&page.tenant_id, endpoint_id, now)? {
                monitors.push(view);
            }
        }
        let overall = monitors
            .iter()
            .map(|m| m.status)
            .max()
            .unwrap_or(DisplayStatus::Unknown);

        Ok(PageView::Unlocked(PageContent {
            slug: page.slug,
            title: page.title,
            description: page.description,
            overall,
            monitors,
        }))
    }

    fn monitor_view(&self, tenant_id: &str, endpoint_id: i64, now: DateTime<Utc>) -> Result<Option<MonitorView>, DbError> {
        let endpoint = match self.store.get_endpoint(tenant_id, endpoint_id) {
            Ok(e) => e,
            Err(DbError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        let recent = self
            .store
            .recent_health_checks(tenant_id, endpoint_id, HISTORY_SLOTS as u32)?;
        let outage = self.store.ongoing_outage(tenant_id, endpoint_id)?;
        let uptime = self
            .aggregator
            .uptime_over(tenant_id, endpoint_id, UPTIME_WINDOW_HOURS, now)?;
        let latest = recent.last();

        Ok(Some(MonitorView {
            endpoint_id,
            name: endpoint.name,
            status: current_status(latest, outage.is_some()),
            last_checked_at: latest.map(|c| c.checked_at),
            latency_ms: latest.and_then(|c| c.latency_ms),
            in_outage: outage.is_some(),
            outage_since: outage.map(|o| o.started_at),
            uptime_24h: uptime.uptime_percentage,
            history: history_strip(&recent, HISTORY_SLOTS),
        }))
    }
}
