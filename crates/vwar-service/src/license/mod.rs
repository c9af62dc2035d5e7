//! License validator.
//!
//! An adaptive-interval polling task: 60 s while the license is stable
//! (more than 30 days left), 30 s between 8 and 30 days, 10 s at 7 days or
//! less, 5 s once expired so renewal is detected quickly. Each tick probes
//! the network with a bounded DNS lookup and validates online against the
//! server or offline against the cached verdict, which is honored for 24 h
//! and stale after that.
//!
//! Transitions are edge-triggered: `LicenseValid` fires exactly once per
//! invalid-to-valid transition, and the expiry warning fires at most once
//! per calendar day once seven days or fewer remain.

pub mod activate;
pub mod hwid;

use crate::engine::{Engine, UiEvent};
use anyhow::Result;
use chrono::{Local, NaiveDate, Utc};
use hwid::HardwareIdentity;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use vwar_core::activation::{self, ActivationRecord, ActivationStore, LicenseCache};
use vwar_core::error::VwarError;

const DNS_PROBE_HOST: &str = "one.one.one.one:443";
const DNS_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct LicenseFetchResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: Vec<ActivationRecord>,
}

#[derive(Debug, Clone)]
struct Decision {
    valid: bool,
    days_remaining: i64,
    valid_until: String,
    online: bool,
    reason: Option<String>,
}

struct ValidatorState {
    last_valid: Option<bool>,
    last_warning_date: Option<NaiveDate>,
    offline_since: Option<String>,
}

pub struct LicenseValidator {
    engine: Arc<Engine>,
    store: ActivationStore,
    client: reqwest::Client,
    hw: HardwareIdentity,
}

impl LicenseValidator {
    pub fn new(engine: Arc<Engine>, client: reqwest::Client) -> Self {
        let store = ActivationStore::new(&engine.layout);
        Self {
            engine,
            store,
            client,
            hw: hwid::detect(),
        }
    }

    /// Interval from the current verdict; see module docs.
    fn interval_for(valid: bool, days_remaining: i64) -> Duration {
        if !valid {
            return Duration::from_secs(5);
        }
        match days_remaining {
            d if d > 30 => Duration::from_secs(60),
            d if d >= 8 => Duration::from_secs(30),
            d if d >= 1 => Duration::from_secs(10),
            _ => Duration::from_secs(5),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut state = ValidatorState {
            last_valid: None,
            last_warning_date: None,
            offline_since: None,
        };
        loop {
            let decision = self.tick(&mut state).await;
            self.apply(&decision, &mut state);
            let interval = Self::interval_for(decision.valid, decision.days_remaining);

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&self, state: &mut ValidatorState) -> Decision {
        if network_available().await {
            state.offline_since = None;
            match self.validate_online().await {
                Ok(decision) => decision,
                // Server unreachable despite DNS working: treat as offline
                // and fall back to the cache.
                Err(VwarError::Network(e)) => {
                    debug!(error = %e, "online validation failed, falling back to cache");
                    self.validate_offline(state)
                }
                // Missing or corrupt activation is an invalid license, not
                // a connectivity problem.
                Err(e) => Decision {
                    valid: false,
                    days_remaining: 0,
                    valid_until: String::new(),
                    online: true,
                    reason: Some(e.to_string()),
                },
            }
        } else {
            if state.offline_since.is_none() {
                state.offline_since = Some(activation::now_rfc3339());
            }
            self.validate_offline(state)
        }
    }

    async fn validate_online(&self) -> Result<Decision, VwarError> {
        let local = self.store.load()?;

        let response = self
            .client
            .post(&self.engine.config.endpoints.license_fetch_url)
            .header("X-API-Key", &self.engine.config.endpoints.license_fetch_key)
            .json(&serde_json::json!({
                "processor_id": self.hw.processor_id,
                "motherboard_id": self.hw.motherboard_id,
            }))
            .send()
            .await
            .map_err(|e| VwarError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(VwarError::Network(format!(
                "license fetch status {}",
                response.status()
            )));
        }
        let body: LicenseFetchResponse = response
            .json()
            .await
            .map_err(|e| VwarError::Network(format!("license decode: {e}")))?;

        let found = match body.data.into_iter().find(|r| r.password == local.password) {
            Some(found) => found,
            None => {
                let decision = Decision {
                    valid: false,
                    days_remaining: 0,
                    valid_until: local.valid_till.clone(),
                    online: true,
                    reason: Some("license record not found on server".into()),
                };
                self.write_cache(&decision);
                return Ok(decision);
            }
        };

        let expiry = found.expiry()?;
        let now = Local::now().naive_local();
        let days_remaining = (expiry.date() - now.date()).num_days();
        let expired = now > expiry;

        // The server is authoritative: persist its record when anything
        // differs so renewals and slot rebinds take effect locally.
        if serde_json::to_string(&found).ok() != serde_json::to_string(&local).ok() {
            if let Err(e) = self.store.store(&found) {
                warn!(error = %e, "could not persist refreshed activation record");
            }
        }

        let decision = Decision {
            valid: !expired,
            days_remaining: days_remaining.max(0),
            valid_until: found.valid_till.clone(),
            online: true,
            reason: expired.then(|| "license expired on server".to_string()),
        };
        self.write_cache(&decision);

        // Side effect of a successful server round-trip: refresh rules.
        let signatures = self.engine.signatures.clone();
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = signatures.fetch_and_merge(&client).await {
                debug!(error = %e, "signature sync skipped");
            }
        });

        Ok(decision)
    }

    fn validate_offline(&self, state: &ValidatorState) -> Decision {
        let grace = chrono::Duration::hours(self.engine.config.license_offline_grace_hours);
        match self.store.load_cache() {
            Ok(cache) => match cache.age() {
                Ok(age) if age <= grace => Decision {
                    valid: cache.is_valid,
                    days_remaining: cache.days_remaining,
                    valid_until: cache.valid_until,
                    online: false,
                    reason: (!cache.is_valid).then(|| "cached verdict is invalid".to_string()),
                },
                _ => Decision {
                    valid: false,
                    days_remaining: 0,
                    valid_until: cache.valid_until,
                    online: false,
                    reason: Some(format!(
                        "{}{}",
                        VwarError::CacheStale,
                        state
                            .offline_since
                            .as_deref()
                            .map(|s| format!(" (offline since {s})"))
                            .unwrap_or_default()
                    )),
                },
            },
            Err(_) => Decision {
                valid: false,
                days_remaining: 0,
                valid_until: String::new(),
                online: false,
                reason: Some("no license cache available offline".into()),
            },
        }
    }

    fn write_cache(&self, decision: &Decision) {
        let cache = LicenseCache {
            is_valid: decision.valid,
            valid_until: decision.valid_until.clone(),
            last_server_check: activation::now_rfc3339(),
            days_remaining: decision.days_remaining,
            network_status: if decision.online { "online" } else { "offline" }.to_string(),
            offline_since: None,
        };
        if let Err(e) = self.store.store_cache(&cache) {
            warn!(error = %e, "license cache write failed");
        }
    }

    fn apply(&self, decision: &Decision, state: &mut ValidatorState) {
        match (decision.valid, state.last_valid) {
            (true, Some(true)) => {}
            (true, _) => {
                self.engine.logs.general.info("[LICENSE] License valid");
                self.engine.emit(UiEvent::LicenseValid);
                if state.last_valid == Some(false) {
                    self.engine.notifier.notify(
                        "License Renewed",
                        "Your license has been renewed!\nAll features are now enabled.",
                    );
                }
            }
            (false, Some(false)) => {}
            (false, _) => {
                let reason = decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| "license invalid".into());
                self.engine
                    .logs
                    .general
                    .warn(&format!("[LICENSE] License invalidated: {reason}"));
                self.engine.notifier.notify(
                    "License Invalid",
                    &format!("Your license is no longer valid.\n{reason}"),
                );
                self.engine.emit(UiEvent::LicenseInvalid { reason });
            }
        }
        state.last_valid = Some(decision.valid);

        if decision.valid && decision.days_remaining <= self.engine.config.license_warning_days {
            let today = Utc::now().date_naive();
            if state.last_warning_date != Some(today) {
                state.last_warning_date = Some(today);
                self.engine.logs.general.warn(&format!(
                    "[LICENSE] Expiry warning: {} days remaining",
                    decision.days_remaining
                ));
                self.engine.notifier.notify(
                    "License Expiring Soon",
                    &format!(
                        "Your license expires in {} day(s).\nPlease renew to continue protection.",
                        decision.days_remaining
                    ),
                );
                self.engine.emit(UiEvent::ExpiryWarning {
                    days: decision.days_remaining,
                });
            }
        }
    }

}

pub async fn set_auto_renew_for(
    client: &reqwest::Client,
    endpoints: &vwar_core::config::Endpoints,
    record_id: i64,
    enable: bool,
) -> Result<bool> {
    let response = client
        .post(&endpoints.auto_renew_url)
        .header("X-API-Key", &endpoints.license_fetch_key)
        .json(&serde_json::json!({
            "id": record_id,
            "auto_renew": if enable { "YES" } else { "NO" },
        }))
        .send()
        .await?;
    Ok(response.status().is_success())
}

/// 2 s DNS probe; failure means offline handling.
pub async fn network_available() -> bool {
    matches!(
        tokio::time::timeout(DNS_PROBE_TIMEOUT, tokio::net::lookup_host(DNS_PROBE_HOST)).await,
        Ok(Ok(_))
    )
}
