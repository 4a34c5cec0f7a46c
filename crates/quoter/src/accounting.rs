use crate::config::AccountingConfig;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where metered usage is billed. Implementations must be thread-safe; the
/// quoter calls it from its own task.
pub trait BillSink: Send + Sync {
    fn bill(&self, record: &BillRecord);
}

/// A sink that drops every record, for quoters with billing disabled.
pub struct NullBillSink;

impl BillSink for NullBillSink {
    fn bill(&self, _record: &BillRecord) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillCategory {
    Provisioned,
    OnDemand,
    Overshoot,
}

/// One billing line covering a single billing window of one resource.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct BillRecord {
    pub category: BillCategory,
    pub quantity: u64,
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,
    pub quoter_path: String,
    pub resource_path: String,
    pub schema: Option<String>,
    pub version: Option<String>,
    pub cloud_id: Option<String>,
    pub folder_id: Option<String>,
    pub resource_id: Option<String>,
    pub source_id: Option<String>,
    pub tags: Option<serde_json::Value>,
}

fn to_datetime(us: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(us as i64).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Per-resource usage accounting. Reported usage is bucketed at the account
/// period; once a billing window fully passes, its usage is split into
/// provisioned / on-demand / overshoot and written to the bill sink.
pub struct RateAccounting {
    cfg: AccountingConfig,
    /// Effective units-per-second of the owning resource.
    rate: f64,
    sink: Arc<dyn BillSink>,
    quoter_path: String,
    resource_path: String,
    /// Bucket start (account-period resolution, us) → units consumed.
    history: BTreeMap<u64, f64>,
    accepted_until: u64,
    /// Start of the next unbilled window; zero until the first report.
    billed_until: u64,
}

impl RateAccounting {
    pub fn new(
        cfg: AccountingConfig,
        rate: f64,
        sink: Arc<dyn BillSink>,
        quoter_path: String,
        resource_path: String,
    ) -> Self {
        Self {
            cfg,
            rate,
            sink,
            quoter_path,
            resource_path,
            history: BTreeMap::new(),
            accepted_until: 0,
            billed_until: 0,
        }
    }

    pub fn configure(&mut self, cfg: AccountingConfig, rate: f64) {
        self.cfg = cfg;
        self.rate = rate;
    }

    pub fn config(&self) -> &AccountingConfig {
        &self.cfg
    }

    fn account_period_us(&self) -> u64 {
        (self.cfg.account_period.map(|d| d.as_micros() as u64).unwrap_or(1_000_000)).max(1)
    }

    fn billing_period_us(&self) -> u64 {
        let period = self
            .cfg
            .provisioned
            .billing_period
            .map(|d| d.as_micros() as u64)
            .unwrap_or(60_000_000);
        period.max(self.account_period_us())
    }

    /// Records usage values measured over consecutive `interval` windows
    /// starting at `start`. Returns the point in time accepted so far.
    pub fn report(&mut self, start_us: u64, interval_us: u64, values: &[f64]) -> u64 {
        let bucket_size = self.account_period_us();
        for (i, value) in values.iter().enumerate() {
            if *value <= 0.0 {
                continue;
            }
            let at = start_us + i as u64 * interval_us;
            let bucket = at - at % bucket_size;
            *self.history.entry(bucket).or_insert(0.0) += value;
        }
        if self.billed_until == 0 {
            if let Some((&first, _)) = self.history.iter().next() {
                let period = self.billing_period_us();
                self.billed_until = first - first % period;
            }
        }
        self.accepted_until = start_us + values.len() as u64 * interval_us;
        self.accepted_until
    }

    /// Bills every fully-elapsed window. Returns true while more history is
    /// pending, which keeps the owning resource ticking.
    pub fn run_accounting(&mut self, now_us: u64) -> bool {
        let period = self.billing_period_us();
        if self.billed_until == 0 {
            return !self.history.is_empty();
        }

        while self.billed_until + period <= now_us {
            let window_start = self.billed_until;
            let window_end = window_start + period;
            self.billed_until = window_end;

            let usage: f64 = {
                let drained: Vec<u64> = self
                    .history
                    .range(window_start..window_end)
                    .map(|(k, _)| *k)
                    .collect();
                let mut sum = 0.0;
                for key in drained {
                    sum += self.history.remove(&key).unwrap_or(0.0);
                }
                sum
            };
            if usage <= 0.0 {
                continue;
            }

            let provisioned_cap = self.rate * self.cfg.provisioned_coefficient.unwrap_or(60.0);
            let overshoot_threshold = provisioned_cap * self.cfg.overshoot_coefficient.unwrap_or(1.1);

            let provisioned = usage.min(provisioned_cap);
            let overshoot = (usage - overshoot_threshold).max(0.0);
            let on_demand = (usage - provisioned - overshoot).max(0.0);

            for (category, metering, amount) in [
                (BillCategory::Provisioned, &self.cfg.provisioned, provisioned),
                (BillCategory::OnDemand, &self.cfg.on_demand, on_demand),
                (BillCategory::Overshoot, &self.cfg.overshoot, overshoot),
            ] {
                let quantity = amount.ceil() as u64;
                if !metering.enabled || quantity == 0 {
                    continue;
                }
                let record = BillRecord {
                    category,
                    quantity,
                    start: to_datetime(window_start),
                    finish: to_datetime(window_end),
                    quoter_path: self.quoter_path.clone(),
                    resource_path: self.resource_path.clone(),
                    schema: metering.schema.clone(),
                    version: metering.version.clone(),
                    cloud_id: metering.cloud_id.clone(),
                    folder_id: metering.folder_id.clone(),
                    resource_id: metering.resource_id.clone(),
                    source_id: metering.source_id.clone(),
                    tags: metering.tags.clone(),
                };
                tracing::debug!(
                    resource = %self.resource_path,
                    ?category,
                    quantity,
                    "billing resource usage"
                );
                metrics::counter!(
                    "quoter_billed_units_total",
                    "resource" => self.resource_path.clone(),
                )
                .increment(quantity);
                self.sink.bill(&record);
            }
        }

        !self.history.is_empty()
    }
}
