use crate::Error;
use std::time::Duration;

/// Configuration of one resource in the quoter tree. Unset fields inherit
/// from the parent resource when effective properties are computed.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    #[serde(default)]
    pub max_units_per_second: Option<f64>,
    #[serde(default)]
    pub prefetch_coefficient: Option<f64>,
    #[serde(default)]
    pub prefetch_watermark: Option<f64>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub accounting: Option<AccountingConfig>,
}

impl ResourceConfig {
    pub fn with_rate(max_units_per_second: f64) -> Self {
        Self { max_units_per_second: Some(max_units_per_second), ..Default::default() }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Validates user-supplied properties. `is_root` additionally requires a
    /// rate, since the root has nothing to inherit from.
    pub fn validate(&self, is_root: bool) -> Result<(), Error> {
        if let Some(rate) = self.max_units_per_second {
            if !rate.is_finite() {
                return Err(Error::InvalidConfig("max_units_per_second must be finite".into()));
            }
            if rate < 0.0 {
                return Err(Error::InvalidConfig("max_units_per_second can't be less than 0".into()));
            }
        }
        if let Some(c) = self.prefetch_coefficient {
            if !c.is_finite() {
                return Err(Error::InvalidConfig("prefetch_coefficient must be finite".into()));
            }
        }
        if let Some(w) = self.prefetch_watermark {
            if !w.is_finite() {
                return Err(Error::InvalidConfig("prefetch_watermark must be finite".into()));
            }
            if !(0.0..=1.0).contains(&w) {
                return Err(Error::InvalidConfig("prefetch_watermark must be within [0, 1]".into()));
            }
        }
        if let Some(weight) = self.weight {
            if weight == 0 {
                return Err(Error::InvalidConfig("weight must be at least 1".into()));
            }
        }
        if is_root && self.max_units_per_second.unwrap_or(0.0) == 0.0 {
            return Err(Error::InvalidConfig("no max_units_per_second parameter in root resource".into()));
        }
        if let Some(accounting) = &self.accounting {
            accounting.validate()?;
        }
        Ok(())
    }
}

/// Rate-accounting configuration. Periods and coefficients inherit from the
/// nearest ancestor; `enabled` does not.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, with = "humantime_serde")]
    pub report_period: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub account_period: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub collect_period: Option<Duration>,
    #[serde(default)]
    pub provisioned_coefficient: Option<f64>,
    #[serde(default)]
    pub overshoot_coefficient: Option<f64>,
    #[serde(default)]
    pub provisioned: MeteringConfig,
    #[serde(default)]
    pub on_demand: MeteringConfig,
    #[serde(default)]
    pub overshoot: MeteringConfig,
}

/// One metering category written to the billing sink.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeteringConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, with = "humantime_serde")]
    pub billing_period: Option<Duration>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub cloud_id: Option<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub tags: Option<serde_json::Value>,
}

impl AccountingConfig {
    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("provisioned_coefficient", self.provisioned_coefficient),
            ("overshoot_coefficient", self.overshoot_coefficient),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(Error::InvalidConfig(format!("{name} must be finite and non-negative")));
                }
            }
        }
        Ok(())
    }

    /// Resolves effective accounting settings against the parent's effective
    /// settings, with the original defaults where both are silent.
    pub fn effective(&self, parent: Option<&AccountingConfig>) -> AccountingConfig {
        let default_period = |own: Option<Duration>, parent_v: Option<Duration>, def_ms: u64| {
            own.or(parent_v).unwrap_or(Duration::from_millis(def_ms))
        };
        AccountingConfig {
            enabled: self.enabled,
            report_period: Some(default_period(
                self.report_period,
                parent.and_then(|p| p.report_period),
                5000,
            )),
            account_period: Some(default_period(
                self.account_period,
                parent.and_then(|p| p.account_period),
                1000,
            )),
            collect_period: Some(default_period(
                self.collect_period,
                parent.and_then(|p| p.collect_period),
                30_000,
            )),
            provisioned_coefficient: Some(
                self.provisioned_coefficient
                    .or(parent.and_then(|p| p.provisioned_coefficient))
                    .unwrap_or(60.0),
            ),
            overshoot_coefficient: Some(
                self.overshoot_coefficient
                    .or(parent.and_then(|p| p.overshoot_coefficient))
                    .unwrap_or(1.1),
            ),
            provisioned: self.provisioned.effective(parent.map(|p| &p.provisioned)),
            on_demand: self.on_demand.effective(parent.map(|p| &p.on_demand)),
            overshoot: self.overshoot.effective(parent.map(|p| &p.overshoot)),
        }
    }
}

impl MeteringConfig {
    fn effective(&self, parent: Option<&MeteringConfig>) -> MeteringConfig {
        let inherit = |own: &Option<String>, parent_v: Option<&Option<String>>| {
            own.clone().or_else(|| parent_v.and_then(|p| p.clone()))
        };
        MeteringConfig {
            // `enabled` is not inherited.
            enabled: self.enabled,
            billing_period: Some(
                self.billing_period
                    .or(parent.and_then(|p| p.billing_period))
                    .unwrap_or(Duration::from_secs(60)),
            ),
            version: inherit(&self.version, parent.map(|p| &p.version)),
            schema: inherit(&self.schema, parent.map(|p| &p.schema)),
            cloud_id: inherit(&self.cloud_id, parent.map(|p| &p.cloud_id)),
            folder_id: inherit(&self.folder_id, parent.map(|p| &p.folder_id)),
            resource_id: inherit(&self.resource_id, parent.map(|p| &p.resource_id)),
            source_id: inherit(&self.source_id, parent.map(|p| &p.source_id)),
            tags: self.tags.clone().or_else(|| parent.and_then(|p| p.tags.clone())),
        }
    }
}

/// Splits a path on `/`, validates component characters, and re-joins it
/// without a leading slash.
pub fn canonize_path(path: &str) -> Result<String, Error> {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }
    for component in &components {
        for c in component.chars() {
            let valid = c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':' | '#');
            if !valid {
                return Err(Error::InvalidPath(path.to_string()));
            }
        }
    }
    Ok(components.join("/"))
}

/// The parent path of a canonical path, None for a root.
pub fn parent_path(canonical: &str) -> Option<&str> {
    canonical.rsplit_once('/').map(|(parent, _)| parent)
}
