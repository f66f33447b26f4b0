//! Runtime-tunable configuration snapshots
//!
//! Pool sizes, trigger rules, and retry tunables live in the settings
//! table and are served to the hot paths as immutable snapshots behind
//! atomic pointers. An update validates first, persists second, swaps
//! third; a snapshot pinned by a reader is never mutated.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::db::Db;
use crate::jobs::cron::parse_cron;
use crate::models::{Phase, TriggerSlot, TriggerType};
use crate::{Error, Result};

/// Worker counts per phase pool, each within [1, 10]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub metadata_workers: usize,
    pub thumbnail_workers: usize,
    pub sprites_workers: usize,
}

impl PoolConfig {
    pub const MIN_WORKERS: usize = 1;
    pub const MAX_WORKERS: usize = 10;

    pub fn workers_for(&self, phase: Phase) -> usize {
        match phase {
            Phase::Metadata => self.metadata_workers,
            Phase::Thumbnail => self.thumbnail_workers,
            Phase::Sprites => self.sprites_workers,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for phase in Phase::ALL {
            let n = self.workers_for(phase);
            if !(Self::MIN_WORKERS..=Self::MAX_WORKERS).contains(&n) {
                return Err(Error::validation(format!(
                    "{} workers must be between {} and {}",
                    phase,
                    Self::MIN_WORKERS,
                    Self::MAX_WORKERS
                )));
            }
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            metadata_workers: 2,
            thumbnail_workers: 2,
            sprites_workers: 1,
        }
    }
}

/// One trigger-table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub trigger_type: TriggerType,

    /// Predecessor phase, required for `after_job`. Typed as a
    /// processing phase, so `scan` can never be a successor target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_phase: Option<Phase>,

    /// 5-field cron expression, required for `scheduled`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

impl TriggerRule {
    pub fn manual() -> Self {
        Self {
            trigger_type: TriggerType::Manual,
            after_phase: None,
            cron: None,
        }
    }

    pub fn on_import() -> Self {
        Self {
            trigger_type: TriggerType::OnImport,
            after_phase: None,
            cron: None,
        }
    }

    pub fn after_job(phase: Phase) -> Self {
        Self {
            trigger_type: TriggerType::AfterJob,
            after_phase: Some(phase),
            cron: None,
        }
    }

    pub fn scheduled(expr: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::Scheduled,
            after_phase: None,
            cron: Some(expr.into()),
        }
    }
}

/// Full trigger table, one rule per slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub metadata: TriggerRule,
    pub thumbnail: TriggerRule,
    pub sprites: TriggerRule,
    pub scan: TriggerRule,
}

impl TriggerConfig {
    pub fn rule_for(&self, slot: TriggerSlot) -> &TriggerRule {
        match slot {
            TriggerSlot::Metadata => &self.metadata,
            TriggerSlot::Thumbnail => &self.thumbnail,
            TriggerSlot::Sprites => &self.sprites,
            TriggerSlot::Scan => &self.scan,
        }
    }

    pub fn rule_for_phase(&self, phase: Phase) -> &TriggerRule {
        self.rule_for(TriggerSlot::from(phase))
    }

    /// Phases configured to run after `completed` finishes
    pub fn successors_of(&self, completed: Phase) -> Vec<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|phase| {
                let rule = self.rule_for_phase(*phase);
                rule.trigger_type == TriggerType::AfterJob && rule.after_phase == Some(completed)
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        for slot in TriggerSlot::ALL {
            let rule = self.rule_for(slot);

            match rule.trigger_type {
                TriggerType::OnImport => {
                    if slot != TriggerSlot::Metadata {
                        return Err(Error::validation(format!(
                            "on_import is only valid for metadata, not {}",
                            slot
                        )));
                    }
                }
                TriggerType::AfterJob => {
                    if slot == TriggerSlot::Scan {
                        return Err(Error::validation(
                            "scan only accepts manual or scheduled triggers",
                        ));
                    }
                    let after = rule.after_phase.ok_or_else(|| {
                        Error::validation(format!("{} trigger after_job needs after_phase", slot))
                    })?;
                    if Some(after) == slot.phase() {
                        return Err(Error::cycle_detected(format!(
                            "{} cannot run after itself",
                            slot
                        )));
                    }
                }
                TriggerType::Scheduled => {
                    let expr = rule.cron.as_deref().ok_or_else(|| {
                        Error::validation(format!("{} scheduled trigger needs a cron field", slot))
                    })?;
                    parse_cron(expr)?;
                }
                TriggerType::Manual => {}
            }
        }

        self.check_acyclic()
    }

    /// Reject back-edges in the after_job graph. Each phase has at most
    /// one predecessor, so walking predecessor links from every node
    /// visits each chain once.
    fn check_acyclic(&self) -> Result<()> {
        for start in Phase::ALL {
            let mut seen = [false; 3];
            let mut current = start;
            loop {
                let idx = current as usize;
                if seen[idx] {
                    return Err(Error::cycle_detected(format!(
                        "after_job triggers form a cycle through {}",
                        current
                    )));
                }
                seen[idx] = true;

                let rule = self.rule_for_phase(current);
                match (rule.trigger_type, rule.after_phase) {
                    (TriggerType::AfterJob, Some(prev)) => current = prev,
                    _ => break,
                }
            }
        }
        Ok(())
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            metadata: TriggerRule::on_import(),
            thumbnail: TriggerRule::after_job(Phase::Metadata),
            sprites: TriggerRule::after_job(Phase::Thumbnail),
            scan: TriggerRule::manual(),
        }
    }
}

/// Backoff tunables for one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_s: u64,
    pub max_delay_s: u64,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// Delay after attempt `k` fails: `min(max, initial · factor^(k-1))`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = self.initial_delay_s as f64 * self.backoff_factor.powi(exponent as i32);
        let capped = delay.min(self.max_delay_s as f64);
        Duration::from_secs_f64(capped)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=20).contains(&self.max_retries) {
            return Err(Error::validation("max_retries must be between 1 and 20"));
        }
        if !(1..=3600).contains(&self.initial_delay_s) {
            return Err(Error::validation(
                "initial_delay_s must be between 1 and 3600",
            ));
        }
        if self.max_delay_s < self.initial_delay_s {
            return Err(Error::validation(
                "max_delay_s cannot be below initial_delay_s",
            ));
        }
        if !(1.0..=10.0).contains(&self.backoff_factor) {
            return Err(Error::validation(
                "backoff_factor must be between 1.0 and 10.0",
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_s: 2,
            max_delay_s: 60,
            backoff_factor: 2.0,
        }
    }
}

/// Per-phase retry policies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub metadata: RetryPolicy,
    pub thumbnail: RetryPolicy,
    pub sprites: RetryPolicy,
}

impl RetryConfig {
    pub fn policy_for(&self, phase: Phase) -> &RetryPolicy {
        match phase {
            Phase::Metadata => &self.metadata,
            Phase::Thumbnail => &self.thumbnail,
            Phase::Sprites => &self.sprites,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for phase in Phase::ALL {
            self.policy_for(phase).validate()?;
        }
        Ok(())
    }
}

/// Which snapshot changed, for subscriber callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Pool,
    Trigger,
    Retry,
}

type ChangeListener = Box<dyn Fn(ConfigKind) + Send + Sync>;

const POOL_KEY: &str = "pool_config";
const TRIGGER_KEY: &str = "trigger_config";
const RETRY_KEY: &str = "retry_config";

/// In-memory, atomically-swappable config snapshots rebuilt from the
/// settings table
pub struct ConfigCache {
    db: Db,
    pool: ArcSwap<PoolConfig>,
    trigger: ArcSwap<TriggerConfig>,
    retry: ArcSwap<RetryConfig>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl ConfigCache {
    /// Build from the settings table, falling back to defaults for
    /// missing keys. Stored-but-invalid config fails the boot.
    pub async fn load(db: Db) -> Result<Arc<Self>> {
        let cache = Arc::new(Self {
            db,
            pool: ArcSwap::from_pointee(PoolConfig::default()),
            trigger: ArcSwap::from_pointee(TriggerConfig::default()),
            retry: ArcSwap::from_pointee(RetryConfig::default()),
            listeners: Mutex::new(Vec::new()),
        });
        cache.refresh_from_store().await?;
        Ok(cache)
    }

    /// Lock-free read of the current pool snapshot
    pub fn pool(&self) -> Arc<PoolConfig> {
        self.pool.load_full()
    }

    pub fn trigger(&self) -> Arc<TriggerConfig> {
        self.trigger.load_full()
    }

    pub fn retry(&self) -> Arc<RetryConfig> {
        self.retry.load_full()
    }

    /// Register a callback invoked after every successful swap
    pub fn subscribe(&self, listener: impl Fn(ConfigKind) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("config listeners poisoned")
            .push(Box::new(listener));
    }

    /// Validate, persist, and swap a new pool config
    pub async fn update_pool(&self, config: PoolConfig) -> Result<()> {
        config.validate()?;
        self.save(POOL_KEY, &config).await?;
        self.pool.store(Arc::new(config));
        info!("Pool config updated");
        self.notify(ConfigKind::Pool);
        Ok(())
    }

    pub async fn update_trigger(&self, config: TriggerConfig) -> Result<()> {
        config.validate()?;
        self.save(TRIGGER_KEY, &config).await?;
        self.trigger.store(Arc::new(config));
        info!("Trigger config updated");
        self.notify(ConfigKind::Trigger);
        Ok(())
    }

    pub async fn update_retry(&self, config: RetryConfig) -> Result<()> {
        config.validate()?;
        self.save(RETRY_KEY, &config).await?;
        self.retry.store(Arc::new(config));
        info!("Retry config updated");
        self.notify(ConfigKind::Retry);
        Ok(())
    }

    /// Rebuild all three snapshots from the settings table. On any
    /// validation failure nothing is swapped and the prior snapshots
    /// stay active.
    pub async fn refresh_from_store(&self) -> Result<()> {
        let pool: PoolConfig = self.load_or_default(POOL_KEY).await?;
        let trigger: TriggerConfig = self.load_or_default(TRIGGER_KEY).await?;
        let retry: RetryConfig = self.load_or_default(RETRY_KEY).await?;

        pool.validate()
            .and_then(|_| trigger.validate())
            .and_then(|_| retry.validate())
            .map_err(|e| {
                warn!("Config refresh rejected: {}", e);
                Error::config_invalid(format!("stored config failed validation: {}", e))
            })?;

        self.pool.store(Arc::new(pool));
        self.trigger.store(Arc::new(trigger));
        self.retry.store(Arc::new(retry));

        self.notify(ConfigKind::Pool);
        self.notify(ConfigKind::Trigger);
        self.notify(ConfigKind::Retry);
        Ok(())
    }

    fn notify(&self, kind: ConfigKind) {
        let listeners = self.listeners.lock().expect("config listeners poisoned");
        for listener in listeners.iter() {
            listener(kind);
        }
    }

    async fn load_or_default<T>(&self, key: &str) -> Result<T>
    where
        T: Default + for<'de> Deserialize<'de>,
    {
        let row: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;

        match row {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| Error::config_invalid(format!("corrupt setting {}: {}", key, e))),
            None => Ok(T::default()),
        }
    }

    async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| Error::internal(format!("serialize setting {}: {}", key, e)))?;

        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(json)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pool_bounds() {
        assert!(PoolConfig::default().validate().is_ok());

        let zero = PoolConfig {
            metadata_workers: 0,
            ..PoolConfig::default()
        };
        assert!(zero.validate().is_err());

        let eleven = PoolConfig {
            sprites_workers: 11,
            ..PoolConfig::default()
        };
        assert!(eleven.validate().is_err());
    }

    #[test]
    fn test_trigger_semantic_rules() {
        // on_import outside metadata
        let mut cfg = TriggerConfig::default();
        cfg.thumbnail = TriggerRule::on_import();
        assert!(cfg.validate().is_err());

        // scan may not be after_job
        let mut cfg = TriggerConfig::default();
        cfg.scan = TriggerRule::after_job(Phase::Metadata);
        assert!(cfg.validate().is_err());

        // after_job without after_phase
        let mut cfg = TriggerConfig::default();
        cfg.sprites = TriggerRule {
            trigger_type: TriggerType::AfterJob,
            after_phase: None,
            cron: None,
        };
        assert!(cfg.validate().is_err());

        // scheduled without cron
        let mut cfg = TriggerConfig::default();
        cfg.scan = TriggerRule {
            trigger_type: TriggerType::Scheduled,
            after_phase: None,
            cron: None,
        };
        assert!(cfg.validate().is_err());

        // scheduled scan with a good expression is fine
        let mut cfg = TriggerConfig::default();
        cfg.scan = TriggerRule::scheduled("0 3 * * *");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_cycle_rejection() {
        // metadata -> thumbnail -> metadata
        let cfg = TriggerConfig {
            metadata: TriggerRule::after_job(Phase::Thumbnail),
            thumbnail: TriggerRule::after_job(Phase::Metadata),
            sprites: TriggerRule::manual(),
            scan: TriggerRule::manual(),
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "CYCLE_DETECTED");

        // self-edge
        let cfg = TriggerConfig {
            metadata: TriggerRule::on_import(),
            thumbnail: TriggerRule::after_job(Phase::Thumbnail),
            sprites: TriggerRule::manual(),
            scan: TriggerRule::manual(),
        };
        assert_eq!(cfg.validate().unwrap_err().code(), "CYCLE_DETECTED");

        // three-node cycle
        let cfg = TriggerConfig {
            metadata: TriggerRule::after_job(Phase::Sprites),
            thumbnail: TriggerRule::after_job(Phase::Metadata),
            sprites: TriggerRule::after_job(Phase::Thumbnail),
            scan: TriggerRule::manual(),
        };
        assert_eq!(cfg.validate().unwrap_err().code(), "CYCLE_DETECTED");

        // the default chain is acyclic
        assert!(TriggerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_successors() {
        let cfg = TriggerConfig::default();
        assert_eq!(cfg.successors_of(Phase::Metadata), vec![Phase::Thumbnail]);
        assert_eq!(cfg.successors_of(Phase::Thumbnail), vec![Phase::Sprites]);
        assert!(cfg.successors_of(Phase::Sprites).is_empty());
    }

    #[test]
    fn test_backoff_formula() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_s: 2,
            max_delay_s: 60,
            backoff_factor: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        // capped at max_delay
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_bounds() {
        assert!(RetryConfig::default().validate().is_ok());

        let bad = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());

        let inverted = RetryPolicy {
            initial_delay_s: 100,
            max_delay_s: 10,
            ..RetryPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[tokio::test]
    async fn test_update_persists_and_notifies() {
        let db = Db::open_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let cache = ConfigCache::load(db.clone()).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        cache.subscribe(move |kind| {
            if kind == ConfigKind::Pool {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let new_pool = PoolConfig {
            metadata_workers: 5,
            ..PoolConfig::default()
        };
        cache.update_pool(new_pool.clone()).await.unwrap();
        assert_eq!(*cache.pool(), new_pool);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A second cache over the same db sees the persisted value.
        let reloaded = ConfigCache::load(db).await.unwrap();
        assert_eq!(reloaded.pool().metadata_workers, 5);
    }

    #[tokio::test]
    async fn test_invalid_update_leaves_snapshot() {
        let db = Db::open_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let cache = ConfigCache::load(db).await.unwrap();

        let before = cache.trigger();
        let bad = TriggerConfig {
            metadata: TriggerRule::after_job(Phase::Thumbnail),
            thumbnail: TriggerRule::after_job(Phase::Metadata),
            sprites: TriggerRule::manual(),
            scan: TriggerRule::manual(),
        };
        assert!(cache.update_trigger(bad).await.is_err());
        assert_eq!(*cache.trigger(), *before);
    }
}
