//! Cron-fired triggers: scheduled phase sweeps and library scans
//!
//! Trigger rules carry standard 5-field cron expressions. The `cron`
//! crate wants a seconds column, so parsing prepends one; anything that
//! is not exactly five fields is rejected up front.

use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::configcache::{ConfigCache, TriggerConfig};
use crate::jobs::trigger::TriggerEngine;
use crate::models::{BulkMode, TriggerSlot, TriggerType};
use crate::traits::{Clock, LibraryScanner};
use crate::{Error, Result};

/// Parse a standard 5-field cron expression
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(Error::validation(format!(
            "cron expression must have 5 fields, got {}",
            fields
        )));
    }

    Schedule::from_str(&format!("0 {}", expr.trim()))
        .map_err(|e| Error::validation(format!("invalid cron expression {:?}: {}", expr, e)))
}

/// Fires scheduled triggers; rebuilt whenever the trigger config swaps
pub struct CronScheduler {
    configs: Arc<ConfigCache>,
    engine: Arc<TriggerEngine>,
    scanner: Arc<dyn LibraryScanner>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    rebuild_rx: watch::Receiver<u64>,
    rebuild_tx: watch::Sender<u64>,
}

impl CronScheduler {
    pub fn new(
        configs: Arc<ConfigCache>,
        engine: Arc<TriggerEngine>,
        scanner: Arc<dyn LibraryScanner>,
        clock: Arc<dyn Clock>,
        tick: Duration,
    ) -> Self {
        let (rebuild_tx, rebuild_rx) = watch::channel(0);
        Self {
            configs,
            engine,
            scanner,
            clock,
            tick,
            rebuild_rx,
            rebuild_tx,
        }
    }

    /// Sender the config cache's change callback bumps to force an
    /// atomic schedule rebuild
    pub fn rebuild_handle(&self) -> watch::Sender<u64> {
        self.rebuild_tx.clone()
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        info!("Starting cron scheduler: tick={:?}", self.tick);
        tokio::spawn(async move {
            let mut rebuild_rx = self.rebuild_rx.clone();
            let mut schedules = build_schedules(&self.configs.trigger());
            let mut last = self.now();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rebuild_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // Swap the whole schedule set; no stale firings
                        // across configs.
                        schedules = build_schedules(&self.configs.trigger());
                        debug!("Cron schedules rebuilt: count={}", schedules.len());
                        continue;
                    }
                    _ = sleep(self.tick) => {}
                }

                let now = self.now();
                for (slot, schedule) in &schedules {
                    let due = schedule
                        .after(&last)
                        .next()
                        .map(|occurrence| occurrence <= now)
                        .unwrap_or(false);
                    if due {
                        self.fire(*slot).await;
                    }
                }
                last = now;
            }
            info!("Cron scheduler stopped");
        })
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.clock.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }

    async fn fire(&self, slot: TriggerSlot) {
        match slot.phase() {
            Some(phase) => {
                info!("Cron fired: phase={}", phase);
                if let Err(e) = self.engine.bulk_run_phase(phase, BulkMode::Missing).await {
                    warn!("Scheduled bulk run failed: phase={}, error={}", phase, e);
                }
            }
            None => {
                info!("Cron fired: library scan");
                match self.scanner.scan().await {
                    Ok(summary) => {
                        info!(
                            "Library scan done: discovered={}, imported={}, errors={}",
                            summary.discovered, summary.imported, summary.errors
                        );
                    }
                    Err(e) => warn!("Library scan failed: {}", e),
                }
            }
        }
    }
}

fn build_schedules(config: &TriggerConfig) -> Vec<(TriggerSlot, Schedule)> {
    let mut schedules = Vec::new();
    for slot in TriggerSlot::ALL {
        let rule = config.rule_for(slot);
        if rule.trigger_type != TriggerType::Scheduled {
            continue;
        }
        let Some(expr) = rule.cron.as_deref() else {
            continue;
        };
        match parse_cron(expr) {
            Ok(schedule) => schedules.push((slot, schedule)),
            // Validation keeps this out of the store; a parse failure
            // here means the table predates the current rules.
            Err(e) => warn!("Skipping unparseable cron for {}: {}", slot, e),
        }
    }
    schedules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_standard_five_field_form() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 3 * * *").is_ok());
        assert!(parse_cron("30 2 * * 1-5").is_ok());
    }

    #[test]
    fn test_rejects_six_field_form() {
        let err = parse_cron("0 0 3 * * *").unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_rejects_malformed_expressions() {
        assert!(parse_cron("").is_err());
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("99 * * * *").is_err());
        assert!(parse_cron("* * * *").is_err());
    }

    #[test]
    fn test_occurrences_advance() {
        let schedule = parse_cron("0 3 * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let first = schedule.after(&start).next().unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_build_schedules_only_takes_scheduled_rules() {
        use crate::configcache::TriggerRule;
        let config = TriggerConfig {
            metadata: TriggerRule::on_import(),
            thumbnail: TriggerRule::scheduled("0 4 * * *"),
            sprites: TriggerRule::manual(),
            scan: TriggerRule::scheduled("0 2 * * *"),
        };
        let schedules = build_schedules(&config);
        let slots: Vec<TriggerSlot> = schedules.iter().map(|(s, _)| *s).collect();
        assert_eq!(slots, vec![TriggerSlot::Thumbnail, TriggerSlot::Scan]);
    }
}
