use std::collections::BTreeMap;
use std::path::Path;

use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::CoPowerState;
use crate::types::CoId;

#[derive(RustEmbed)]
#[folder = "data/"]
struct EmbeddedTables;

const UNITS_TABLE: &str = "units.json";
const COS_TABLE: &str = "cos.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub name: String,
    pub cost: i64,
    pub max_fuel: i64,
    pub max_ammo: i64,
    pub movement_type: String,
}

fn neutral_multiplier() -> f64 {
    1.0
}

/// Unit price multipliers of one commanding officer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoInfo {
    pub id: CoId,
    pub name: String,
    #[serde(default = "neutral_multiplier")]
    pub day_to_day_cost: f64,
    #[serde(default = "neutral_multiplier")]
    pub power_cost: f64,
    #[serde(default = "neutral_multiplier")]
    pub super_power_cost: f64,
}

/// Layout of an override file: either table may be left out.
#[derive(Debug, Default, Deserialize)]
struct TableOverrides {
    #[serde(default)]
    units: Vec<UnitInfo>,
    #[serde(default)]
    cos: Vec<CoInfo>,
}

/// Read-only reference tables looked up while folding actions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameConstants {
    units: BTreeMap<String, UnitInfo>,
    cos: BTreeMap<CoId, CoInfo>,
}

fn embedded(name: &str) -> Result<Vec<u8>> {
    EmbeddedTables::get(name)
        .map(|file| file.data.into_owned())
        .ok_or_else(|| Error::missing(format!("embedded table {name}")))
}

impl GameConstants {
    /// Tables shipped inside the crate.
    pub fn defaults() -> Result<Self> {
        let units: Vec<UnitInfo> = serde_json::from_slice(&embedded(UNITS_TABLE)?)?;
        let cos: Vec<CoInfo> = serde_json::from_slice(&embedded(COS_TABLE)?)?;
        let mut constants = GameConstants::default();
        constants.extend(units, cos);
        Ok(constants)
    }

    /// Merges entries from a JSON file shaped like `{"units": [...], "cos": [...]}`
    /// over the current tables.
    pub fn apply_overrides(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        self.apply_overrides_json(&bytes)
    }

    pub fn apply_overrides_json(&mut self, bytes: &[u8]) -> Result<()> {
        let overrides: TableOverrides = serde_json::from_slice(bytes)?;
        self.extend(overrides.units, overrides.cos);
        Ok(())
    }

    fn extend(&mut self, units: Vec<UnitInfo>, cos: Vec<CoInfo>) {
        self.units
            .extend(units.into_iter().map(|unit| (unit.name.clone(), unit)));
        self.cos.extend(cos.into_iter().map(|co| (co.id, co)));
    }

    pub fn unit(&self, name: &str) -> Option<&UnitInfo> {
        self.units.get(name)
    }

    pub fn co(&self, id: CoId) -> Option<&CoInfo> {
        self.cos.get(&id)
    }

    pub fn co_name(&self, id: CoId) -> Option<&str> {
        self.co(id).map(|co| co.name.as_str())
    }

    /// Price multiplier for units bought by `co_id`. A running power takes
    /// precedence over the day-to-day rate; unknown COs pay list price.
    pub fn cost_multiplier(&self, co_id: CoId, power: CoPowerState) -> f64 {
        let Some(co) = self.co(co_id) else {
            return 1.0;
        };
        match power {
            CoPowerState::Power => co.power_cost,
            CoPowerState::SuperPower => co.super_power_cost,
            CoPowerState::None => co.day_to_day_cost,
        }
    }
}
