//! Accessors over the JSON action payloads.
//!
//! The server writes numbers inconsistently (`5`, `5.0` and `"5"` all show
//! up), so numeric reads are lenient. Unit patches are strict: a key outside
//! the unit schema is an error.

use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::{Error, ErrorKind, Result};
use crate::model::ReplayUnit;
use crate::types::{PlayerId, Position, UnitId};
use crate::wire::parse_flag;

const UNIT_PATCH_RECORD: &str = "unit patch";

pub fn object<'v>(value: &'v Value, what: &str) -> Result<&'v Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| Error::malformed(format!("{what} must be an object, found {value}")))
}

pub fn field<'v>(payload: &'v Value, key: &str) -> Result<&'v Value> {
    payload
        .get(key)
        .filter(|value| !value.is_null())
        .ok_or_else(|| Error::malformed(format!("payload is missing `{key}`")))
}

/// Optional field. `null` and the empty-array placeholder both mean absent.
pub fn opt_field<'v>(payload: &'v Value, key: &str) -> Option<&'v Value> {
    payload.get(key).filter(|value| match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        _ => true,
    })
}

pub fn int(value: &Value, what: &str) -> Result<i64> {
    let parsed = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.fract() == 0.0).map(|v| v as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::malformed(format!("`{what}` is not an integer: {value}")))
}

pub fn float(value: &Value, what: &str) -> Result<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::malformed(format!("`{what}` is not a number: {value}")))
}

pub fn flag(value: &Value, what: &str) -> Result<bool> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::String(text) => parse_flag(text),
        Value::Number(_) => Ok(int(value, what)? != 0),
        _ => Err(Error::malformed(format!("`{what}` is not a flag: {value}"))),
    }
}

pub fn string(value: &Value, what: &str) -> Result<String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        _ => Err(Error::malformed(format!("`{what}` is not a string: {value}"))),
    }
}

/// Single-letter enum code such as a weather or power state.
pub fn code<T: FromStr>(value: &Value, what: &str) -> Result<T> {
    let text = string(value, what)?;
    T::from_str(&text).map_err(|_| Error::malformed(format!("unknown `{what}` code {text:?}")))
}

pub fn id<T>(value: &Value, what: &str) -> Result<T>
where
    T: TryFrom<i64, Error = Error>,
{
    T::try_from(int(value, what)?)
}

pub fn coordinate(value: &Value, what: &str) -> Result<i32> {
    let raw = int(value, what)?;
    i32::try_from(raw).map_err(|_| Error::malformed(format!("`{what}` out of range: {raw}")))
}

pub fn int_field(payload: &Value, key: &str) -> Result<i64> {
    int(field(payload, key)?, key)
}

pub fn opt_int_field(payload: &Value, key: &str) -> Result<Option<i64>> {
    opt_field(payload, key).map(|value| int(value, key)).transpose()
}

pub fn id_field<T>(payload: &Value, key: &str) -> Result<T>
where
    T: TryFrom<i64, Error = Error>,
{
    id(field(payload, key)?, key)
}

pub fn position_field(payload: &Value, x_key: &str, y_key: &str) -> Result<Position> {
    Ok(Position::new(
        coordinate(field(payload, x_key)?, x_key)?,
        coordinate(field(payload, y_key)?, y_key)?,
    ))
}

/// Elements of a list. PHP serializes sparse arrays as objects keyed by
/// index, so object values are accepted in key order too.
pub fn items<'v>(value: &'v Value, what: &str) -> Result<Vec<&'v Value>> {
    match value {
        Value::Array(items) => Ok(items.iter().collect()),
        Value::Object(map) => Ok(map.values().collect()),
        _ => Err(Error::malformed(format!("`{what}` is not a list: {value}"))),
    }
}

pub fn id_list<T>(value: &Value, what: &str) -> Result<Vec<T>>
where
    T: TryFrom<i64, Error = Error>,
{
    items(value, what)?
        .into_iter()
        .map(|item| id(item, what))
        .collect()
}

/// Object keyed by player id.
pub fn per_player<'v>(value: &'v Value, what: &str) -> Result<Vec<(PlayerId, &'v Value)>> {
    object(value, what)?
        .iter()
        .map(|(key, value)| {
            let raw = key
                .parse::<i64>()
                .map_err(|_| Error::malformed(format!("`{what}` key {key:?} is not a player id")))?;
            Ok((PlayerId::try_from(raw)?, value))
        })
        .collect()
}

fn opt_int(value: Option<&Value>, what: &str) -> Result<Option<i64>> {
    value
        .filter(|value| !value.is_null())
        .map(|value| int(value, what))
        .transpose()
}

/// Decodes a `units_*` object into a unit patch. Only `units_id` is
/// required; absent and null keys leave the field unset.
pub fn unit_patch(value: &Value) -> Result<ReplayUnit> {
    let map = object(value, "unit patch")?;
    let unit_id = map
        .get("units_id")
        .ok_or_else(|| Error::malformed("unit patch is missing `units_id`"))
        .and_then(|value| id::<UnitId>(value, "units_id"))?;
    let mut unit = ReplayUnit::new(unit_id);
    let mut cargo1 = None;
    let mut cargo2 = None;

    for (key, value) in map {
        let present = Some(value).filter(|value| !value.is_null());
        let k = key.as_str();
        match k {
            "units_id" | "units_games_id" => {}
            "units_players_id" => {
                unit.player_id = opt_int(present, k)?.map(PlayerId::try_from).transpose()?
            }
            "units_name" => unit.name = present.map(|v| string(v, k)).transpose()?,
            "units_movement_points" => unit.movement_points = opt_int(present, k)?,
            "units_vision" => unit.vision = opt_int(present, k)?,
            "units_fuel" => unit.fuel = opt_int(present, k)?,
            "units_fuel_per_turn" => unit.fuel_per_turn = opt_int(present, k)?,
            "units_sub_dive" => unit.sub_dive = present.map(|v| flag(v, k)).transpose()?,
            "units_ammo" => unit.ammo = opt_int(present, k)?,
            "units_short_range" => unit.short_range = opt_int(present, k)?,
            "units_long_range" => unit.long_range = opt_int(present, k)?,
            "units_second_weapon" => {
                unit.second_weapon = present.map(|v| flag(v, k)).transpose()?
            }
            "units_cost" => unit.cost = opt_int(present, k)?,
            "units_movement_type" => {
                unit.movement_type = present.map(|v| string(v, k)).transpose()?
            }
            "units_x" => unit.x = present.map(|v| coordinate(v, k)).transpose()?,
            "units_y" => unit.y = present.map(|v| coordinate(v, k)).transpose()?,
            "units_moved" => unit.moved = opt_int(present, k)?,
            "units_capture" => unit.capture = opt_int(present, k)?,
            "units_fired" => unit.fired = opt_int(present, k)?,
            "units_hit_points" => unit.hit_points = present.map(|v| float(v, k)).transpose()?,
            "units_cargo1_units_id" => cargo1 = Some(opt_int(present, k)?.unwrap_or(0)),
            "units_cargo2_units_id" => cargo2 = Some(opt_int(present, k)?.unwrap_or(0)),
            "units_carried" => unit.carried = present.map(|v| flag(v, k)).transpose()?,
            _ => {
                return Err(ErrorKind::UnknownField {
                    record: UNIT_PATCH_RECORD,
                    field: key.clone(),
                }
                .into());
            }
        }
    }

    if let (Some(first), Some(second)) = (cargo1, cargo2) {
        unit.cargo = Some(
            [first, second]
                .into_iter()
                .filter(|id| *id != 0)
                .map(UnitId::try_from)
                .collect::<Result<Vec<_>>>()?,
        );
    }
    Ok(unit)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numbers_are_lenient() {
        assert_eq!(int(&json!(5), "n").unwrap(), 5);
        assert_eq!(int(&json!(5.0), "n").unwrap(), 5);
        assert_eq!(int(&json!("5"), "n").unwrap(), 5);
        assert!(int(&json!(5.5), "n").is_err());
        assert_eq!(float(&json!("7.5"), "n").unwrap(), 7.5);
    }

    #[test]
    fn flags_accept_bool_and_letters() {
        assert!(flag(&json!(true), "f").unwrap());
        assert!(flag(&json!("Y"), "f").unwrap());
        assert!(!flag(&json!("N"), "f").unwrap());
        assert!(!flag(&json!(0), "f").unwrap());
    }

    #[test]
    fn placeholder_array_is_absent() {
        let payload = json!({"Move": [], "other": null, "kept": [1]});
        assert!(opt_field(&payload, "Move").is_none());
        assert!(opt_field(&payload, "other").is_none());
        assert!(opt_field(&payload, "kept").is_some());
    }

    #[test]
    fn unit_patch_leaves_absent_fields_unset() {
        let patch = unit_patch(&json!({
            "units_id": 7,
            "units_x": 3,
            "units_y": "4",
            "units_hit_points": 9,
            "units_fuel": null,
        }))
        .unwrap();
        assert_eq!(patch.id, UnitId(7));
        assert_eq!(patch.position(), Some(Position::new(3, 4)));
        assert_eq!(patch.hit_points, Some(9.0));
        assert_eq!(patch.fuel, None);
        assert_eq!(patch.cargo, None);
    }

    #[test]
    fn unit_patch_cargo_needs_both_slots() {
        let patch = unit_patch(&json!({
            "units_id": 7,
            "units_cargo1_units_id": 8,
            "units_cargo2_units_id": 0,
        }))
        .unwrap();
        assert_eq!(patch.cargo, Some(vec![UnitId(8)]));
    }

    #[test]
    fn unit_patch_rejects_unknown_keys() {
        let err = unit_patch(&json!({"units_id": 7, "units_mood": "grumpy"})).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::UnknownField { ref field, .. } if field == "units_mood"
        ));
    }
}
