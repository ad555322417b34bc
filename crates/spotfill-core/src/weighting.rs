//! Instance-type weighting.
//!
//! Converts capacity lost on heterogeneous spot instance types into a number of
//! uniform on-demand replacements. Without a weight table every lost spot
//! instance is replaced by exactly one on-demand instance.

use crate::{CoreError, MarkedInstance, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightTable {
    weights: BTreeMap<String, u32>,
    on_demand_weight: u32,
}

impl WeightTable {
    /// Build a table from order-aligned type and weight lists.
    pub fn from_lists(types: &[String], weights: &[u32], on_demand_weight: u32) -> Result<Self> {
        if types.is_empty() {
            return Err(CoreError::Config(
                "spot instance types must list at least one type".to_string(),
            ));
        }
        if types.len() != weights.len() {
            return Err(CoreError::Config(format!(
                "spot instance types ({}) and weights ({}) must have the same length",
                types.len(),
                weights.len()
            )));
        }
        if on_demand_weight == 0 {
            return Err(CoreError::Config(
                "on-demand weight must be greater than zero".to_string(),
            ));
        }

        let mut table = BTreeMap::new();
        for (instance_type, weight) in types.iter().zip(weights) {
            if table.insert(instance_type.clone(), *weight).is_some() {
                return Err(CoreError::Config(format!(
                    "spot instance type {instance_type} is listed more than once"
                )));
            }
        }

        Ok(Self {
            weights: table,
            on_demand_weight,
        })
    }

    /// Parse the space-separated form used by environment configuration.
    pub fn parse(types: &str, weights: &str, on_demand_weight: &str) -> Result<Self> {
        let types: Vec<String> = types.split_whitespace().map(str::to_string).collect();
        let weights = weights
            .split_whitespace()
            .map(|w| {
                w.parse::<u32>().map_err(|_| {
                    CoreError::Config(format!("spot instance weight '{w}' is not an integer"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let on_demand_weight = on_demand_weight.trim().parse::<u32>().map_err(|_| {
            CoreError::Config(format!(
                "on-demand weight '{}' is not an integer",
                on_demand_weight.trim()
            ))
        })?;

        Self::from_lists(&types, &weights, on_demand_weight)
    }

    pub fn weight_of(&self, instance_type: &str) -> Option<u32> {
        self.weights.get(instance_type).copied()
    }

    pub fn on_demand_weight(&self) -> u32 {
        self.on_demand_weight
    }

    /// Sum of the weights of the given instances.
    pub fn lost_capacity(&self, instances: &[MarkedInstance]) -> Result<u64> {
        instances.iter().try_fold(0u64, |total, instance| {
            self.weight_of(&instance.instance_type)
                .map(|w| total + u64::from(w))
                .ok_or_else(|| CoreError::UnknownInstanceType(instance.instance_type.clone()))
        })
    }

    /// `ceil(lost_capacity / on_demand_weight)`.
    pub fn replacements_needed(&self, instances: &[MarkedInstance]) -> Result<u64> {
        let lost = self.lost_capacity(instances)?;
        Ok(lost.div_ceil(u64::from(self.on_demand_weight)))
    }
}

/// Capacity lost and on-demand instances required to replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replacement {
    pub lost_capacity: u64,
    pub instances: u64,
}

pub fn replacement_for(
    instances: &[MarkedInstance],
    weights: Option<&WeightTable>,
) -> Result<Replacement> {
    match weights {
        Some(table) => Ok(Replacement {
            lost_capacity: table.lost_capacity(instances)?,
            instances: table.replacements_needed(instances)?,
        }),
        None => Ok(Replacement {
            lost_capacity: instances.len() as u64,
            instances: instances.len() as u64,
        }),
    }
}

/// New desired capacity, never above the group's max size.
pub fn clamp_desired(current_desired: u32, additional: u64, max_size: u32) -> u32 {
    let wanted = u64::from(current_desired).saturating_add(additional);
    wanted.min(u64::from(max_size)) as u32
}
