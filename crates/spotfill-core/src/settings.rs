//! Process configuration.
//!
//! Binaries collect raw string options (flags or environment) into
//! [`RawSettings`] / [`RawPollSettings`] and validate them once at start-up.
//! Components only ever see the validated [`Settings`] / [`PollSettings`].

use crate::weighting::WeightTable;
use crate::{CoreError, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_NOTICE_ENDPOINT: &str =
    "http://169.254.169.254/latest/meta-data/spot/termination-time";
pub const DEFAULT_METADATA_BASE: &str = "http://169.254.169.254/latest/meta-data/";
pub const SEMAPHORE_FILE_NAME: &str = "give-up";

/// Location of the termination semaphore consumed by the host's process supervisor.
pub fn default_semaphore_path() -> PathBuf {
    std::env::temp_dir().join(SEMAPHORE_FILE_NAME)
}

/// The spot side of the deployment: a managed group or a fleet request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpotPool {
    Group(String),
    Fleet(String),
}

impl SpotPool {
    /// Exactly one of `group` / `fleet` must be set.
    pub fn from_options(group: Option<&str>, fleet: Option<&str>) -> Result<Self> {
        Self::optional(group, fleet)?.ok_or_else(|| {
            CoreError::Config("one of spot group or spot fleet is required".to_string())
        })
    }

    /// At most one of `group` / `fleet` may be set.
    pub fn optional(group: Option<&str>, fleet: Option<&str>) -> Result<Option<Self>> {
        match (non_empty(group), non_empty(fleet)) {
            (Some(_), Some(_)) => Err(CoreError::Config(
                "only one of spot group or spot fleet may be set".to_string(),
            )),
            (Some(group), None) => Ok(Some(SpotPool::Group(group.to_string()))),
            (None, Some(fleet)) => Ok(Some(SpotPool::Fleet(fleet.to_string()))),
            (None, None) => Ok(None),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SpotPool::Group(name) | SpotPool::Fleet(name) => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SpotPool::Group(_) => "group",
            SpotPool::Fleet(_) => "fleet",
        }
    }
}

/// A function to hand termination over to, identified by its resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionTarget {
    identifier: String,
    region: String,
}

impl FunctionTarget {
    /// Region is the fourth `:`-separated segment, as in
    /// `arn:aws:lambda:us-east-1:123456789012:function:handler`.
    pub fn parse(identifier: &str) -> Result<Self> {
        let region = identifier
            .split(':')
            .nth(3)
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| {
                CoreError::Config(format!(
                    "termination override target '{identifier}' has no region segment"
                ))
            })?;

        Ok(Self {
            identifier: identifier.to_string(),
            region: region.to_string(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

/// Unvalidated control plane options.
#[derive(Debug, Clone, Default)]
pub struct RawSettings {
    pub region: Option<String>,
    pub spot_group: Option<String>,
    pub spot_fleet: Option<String>,
    pub on_demand_group: Option<String>,
    pub scale_down_policy: Option<String>,
    pub stack_name: Option<String>,
    pub spot_instance_types: Option<String>,
    pub spot_instance_weights: Option<String>,
    pub on_demand_weight: Option<String>,
}

/// Validated control plane configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Inventory region. Unset leaves it to the inventory's own default.
    pub region: Option<String>,
    pub spot_pool: SpotPool,
    pub on_demand_group: String,
    pub scale_down_policy: String,
    pub stack_name: String,
    pub weights: Option<WeightTable>,
}

impl Settings {
    pub fn from_raw(raw: &RawSettings) -> Result<Self> {
        let region = non_empty(raw.region.as_deref()).map(str::to_string);
        let spot_pool = SpotPool::from_options(raw.spot_group.as_deref(), raw.spot_fleet.as_deref())?;
        let on_demand_group = required(raw.on_demand_group.as_deref(), "on-demand group")?;
        let scale_down_policy =
            required(raw.scale_down_policy.as_deref(), "on-demand scale-down policy")?;
        let stack_name = required(raw.stack_name.as_deref(), "stack name")?;

        let weights = match (
            non_empty(raw.spot_instance_types.as_deref()),
            non_empty(raw.spot_instance_weights.as_deref()),
            non_empty(raw.on_demand_weight.as_deref()),
        ) {
            (None, None, None) => None,
            (Some(types), Some(weights), Some(on_demand)) => {
                Some(WeightTable::parse(types, weights, on_demand)?)
            }
            _ => {
                return Err(CoreError::Config(
                    "spot instance types, spot instance weights and on-demand weight must be set together"
                        .to_string(),
                ))
            }
        };

        Ok(Self {
            region,
            spot_pool,
            on_demand_group,
            scale_down_policy,
            stack_name,
            weights,
        })
    }
}

/// Unvalidated agent options.
#[derive(Debug, Clone, Default)]
pub struct RawPollSettings {
    pub instance_id: Option<String>,
    pub region: Option<String>,
    pub spot_group: Option<String>,
    pub spot_fleet: Option<String>,
    pub termination_delay: Option<String>,
    pub override_target: Option<String>,
    pub notice_endpoint: Option<String>,
    pub metadata_base: Option<String>,
    pub semaphore_path: Option<PathBuf>,
}

/// Validated agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub instance_id: String,
    pub region: Option<String>,
    pub spot_pool: Option<SpotPool>,
    pub termination_delay: Duration,
    pub override_target: Option<FunctionTarget>,
    pub notice_endpoint: String,
    pub metadata_base: String,
    pub semaphore_path: PathBuf,
}

impl PollSettings {
    pub fn from_raw(raw: &RawPollSettings) -> Result<Self> {
        let instance_id = required(raw.instance_id.as_deref(), "instance id")?;
        let region = non_empty(raw.region.as_deref()).map(str::to_string);
        let spot_pool = SpotPool::optional(raw.spot_group.as_deref(), raw.spot_fleet.as_deref())?;
        let termination_delay = match non_empty(raw.termination_delay.as_deref()) {
            Some(value) => parse_delay(value)?,
            None => Duration::ZERO,
        };
        let override_target = non_empty(raw.override_target.as_deref())
            .map(FunctionTarget::parse)
            .transpose()?;

        Ok(Self {
            instance_id,
            region,
            spot_pool,
            termination_delay,
            override_target,
            notice_endpoint: non_empty(raw.notice_endpoint.as_deref())
                .unwrap_or(DEFAULT_NOTICE_ENDPOINT)
                .to_string(),
            metadata_base: non_empty(raw.metadata_base.as_deref())
                .unwrap_or(DEFAULT_METADATA_BASE)
                .to_string(),
            semaphore_path: raw
                .semaphore_path
                .clone()
                .unwrap_or_else(default_semaphore_path),
        })
    }
}

/// Bare integers are milliseconds; anything else uses humantime syntax (`90s`, `1m 30s`).
pub fn parse_delay(value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(millis) = value.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }
    humantime::parse_duration(value)
        .map_err(|e| CoreError::Config(format!("invalid termination delay '{value}': {e}")))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn required(value: Option<&str>, name: &str) -> Result<String> {
    non_empty(value)
        .map(str::to_string)
        .ok_or_else(|| CoreError::Config(format!("{name} is required")))
}
