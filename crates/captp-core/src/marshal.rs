//! Turning values into `{body, slots}` and back.
//!
//! The engine only ever talks to a [`Marshal`]; capabilities are handed to
//! the engine's `value_to_slot` / `slot_to_value` callbacks and never
//! interpreted by the marshaller itself.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as Json};

use crate::error::CapTpError;
use crate::slot::Slot;
use crate::value::{ErrorValue, Value};

/// Marshalled form of a value: a JSON body plus the slots it references by
/// index.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapData {
    pub body: String,
    pub slots: Vec<Slot>,
}

pub type ValueToSlot<'a> = dyn FnMut(&Value) -> Result<Slot, CapTpError> + 'a;
pub type SlotToValue<'a> = dyn FnMut(Slot, Option<&str>) -> Result<Value, CapTpError> + 'a;

pub trait Marshal {
    fn serialize(
        &self,
        value: &Value,
        value_to_slot: &mut ValueToSlot<'_>,
    ) -> Result<CapData, CapTpError>;

    fn unserialize(
        &self,
        data: &CapData,
        slot_to_value: &mut SlotToValue<'_>,
    ) -> Result<Value, CapTpError>;
}

const QCLASS: &str = "@qclass";

/// JSON encoding with `@qclass` escapes for values JSON cannot express.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMarshal;

impl Marshal for JsonMarshal {
    fn serialize(
        &self,
        value: &Value,
        value_to_slot: &mut ValueToSlot<'_>,
    ) -> Result<CapData, CapTpError> {
        let mut encoder = Encoder {
            value_to_slot,
            slots: Vec::new(),
            slot_index: HashMap::new(),
        };
        let json = encoder.encode(value)?;
        let body = serde_json::to_string(&json).map_err(|e| CapTpError::Marshal(e.to_string()))?;
        Ok(CapData {
            body,
            slots: encoder.slots,
        })
    }

    fn unserialize(
        &self,
        data: &CapData,
        slot_to_value: &mut SlotToValue<'_>,
    ) -> Result<Value, CapTpError> {
        let json: Json =
            serde_json::from_str(&data.body).map_err(|e| CapTpError::Marshal(e.to_string()))?;
        let mut decoder = Decoder {
            slots: &data.slots,
            slot_to_value,
            decoded: HashMap::new(),
        };
        decoder.decode(json)
    }
}

fn qclass(name: &str) -> Map<String, Json> {
    let mut map = Map::new();
    map.insert(QCLASS.to_owned(), Json::String(name.to_owned()));
    map
}

struct Encoder<'a, 'b> {
    value_to_slot: &'a mut ValueToSlot<'b>,
    slots: Vec<Slot>,
    slot_index: HashMap<Slot, usize>,
}

impl Encoder<'_, '_> {
    fn encode(&mut self, value: &Value) -> Result<Json, CapTpError> {
        Ok(match value {
            Value::Undefined => Json::Object(qclass("undefined")),
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number((*i).into()),
            Value::Float(x) => match Number::from_f64(*x) {
                Some(n) => Json::Number(n),
                None if x.is_nan() => Json::Object(qclass("NaN")),
                None if *x > 0.0 => Json::Object(qclass("Infinity")),
                None => Json::Object(qclass("-Infinity")),
            },
            Value::String(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(
                items
                    .iter()
                    .map(|v| self.encode(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Record(entries) => {
                let mut map = Map::new();
                for (k, v) in entries {
                    if k == QCLASS {
                        return Err(CapTpError::Marshal(format!(
                            "record property {QCLASS:?} is reserved"
                        )));
                    }
                    map.insert(k.clone(), self.encode(v)?);
                }
                Json::Object(map)
            }
            Value::Error(e) => {
                let mut map = qclass("error");
                map.insert("name".to_owned(), Json::String(e.name.clone()));
                map.insert("message".to_owned(), Json::String(e.message.clone()));
                Json::Object(map)
            }
            Value::Remotable(_) | Value::Promise(_) => {
                let slot = (self.value_to_slot)(value)?;
                let index = *self.slot_index.entry(slot).or_insert_with(|| {
                    self.slots.push(slot);
                    self.slots.len() - 1
                });
                let mut map = qclass("slot");
                map.insert("index".to_owned(), Json::Number(index.into()));
                if let Value::Remotable(r) = value {
                    map.insert("iface".to_owned(), Json::String(r.iface().to_owned()));
                }
                Json::Object(map)
            }
        })
    }
}

struct Decoder<'a, 'b, 'c> {
    slots: &'a [Slot],
    slot_to_value: &'b mut SlotToValue<'c>,
    decoded: HashMap<usize, Value>,
}

impl Decoder<'_, '_, '_> {
    fn decode(&mut self, json: Json) -> Result<Value, CapTpError> {
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.decode(v))
                    .collect::<Result<_, _>>()?,
            ),
            Json::Object(map) => match map.get(QCLASS) {
                Some(Json::String(class)) => {
                    let class = class.clone();
                    self.decode_qclass(&class, map)?
                }
                Some(other) => {
                    return Err(CapTpError::Marshal(format!("invalid {QCLASS} {other}")));
                }
                None => {
                    let mut entries = BTreeMap::new();
                    for (k, v) in map {
                        entries.insert(k, self.decode(v)?);
                    }
                    Value::Record(entries)
                }
            },
        })
    }

    fn decode_qclass(&mut self, class: &str, map: Map<String, Json>) -> Result<Value, CapTpError> {
        let text = |key: &str| -> String {
            map.get(key)
                .and_then(Json::as_str)
                .map(str::to_owned)
                .unwrap_or_default()
        };
        Ok(match class {
            "undefined" => Value::Undefined,
            "NaN" => Value::Float(f64::NAN),
            "Infinity" => Value::Float(f64::INFINITY),
            "-Infinity" => Value::Float(f64::NEG_INFINITY),
            "error" => Value::Error(ErrorValue {
                name: text("name"),
                message: text("message"),
            }),
            "slot" => {
                let index = map
                    .get("index")
                    .and_then(Json::as_u64)
                    .ok_or_else(|| CapTpError::Marshal("slot without index".to_owned()))?
                    as usize;
                if let Some(value) = self.decoded.get(&index) {
                    return Ok(value.clone());
                }
                let slot = *self.slots.get(index).ok_or_else(|| {
                    CapTpError::Marshal(format!(
                        "slot index {index} out of range for {} slots",
                        self.slots.len()
                    ))
                })?;
                let iface = map.get("iface").and_then(Json::as_str);
                let value = (self.slot_to_value)(slot, iface)?;
                self.decoded.insert(index, value.clone());
                value
            }
            other => {
                return Err(CapTpError::Marshal(format!(
                    "unrecognized {QCLASS} {other:?}"
                )));
            }
        })
    }
}

/// Marshal plain data, refusing any capability.
pub fn to_capdata(marshal: &dyn Marshal, value: &Value) -> Result<CapData, CapTpError> {
    marshal.serialize(value, &mut |v| {
        Err(CapTpError::Marshal(format!("unexpected capability {v:?}")))
    })
}

/// Unmarshal plain data, refusing any slot.
pub fn from_capdata(marshal: &dyn Marshal, data: &CapData) -> Result<Value, CapTpError> {
    marshal.unserialize(data, &mut |slot, _| Err(CapTpError::UnexpectedSlot(slot)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotKind;

    #[test]
    fn plain_data_encodes_as_json() {
        let v = Value::record([
            ("n", Value::Int(3)),
            ("f", Value::Float(0.5)),
            ("s", Value::from("hi")),
            ("l", Value::list([Value::Null, Value::Bool(true)])),
        ]);
        let data = to_capdata(&JsonMarshal, &v).unwrap();
        assert_eq!(
            data.body,
            r#"{"f":0.5,"l":[null,true],"n":3,"s":"hi"}"#
        );
        assert!(data.slots.is_empty());
        assert_eq!(from_capdata(&JsonMarshal, &data).unwrap(), v);
    }

    #[test]
    fn special_values_use_qclass() {
        let v = Value::list([
            Value::Undefined,
            Value::Float(f64::NAN),
            Value::Float(f64::NEG_INFINITY),
            Value::error("RangeError", "too big"),
        ]);
        let data = to_capdata(&JsonMarshal, &v).unwrap();
        assert_eq!(
            data.body,
            r#"[{"@qclass":"undefined"},{"@qclass":"NaN"},{"@qclass":"-Infinity"},{"@qclass":"error","message":"too big","name":"RangeError"}]"#
        );
        assert_eq!(from_capdata(&JsonMarshal, &data).unwrap(), v);
    }

    #[test]
    fn repeated_capability_shares_one_slot() {
        let cap = Value::far("Thing", |_inv: &crate::Invocation| Ok(Value::Undefined));
        let v = Value::list([cap.clone(), cap.clone()]);
        let mut calls = 0;
        let data = JsonMarshal
            .serialize(&v, &mut |_| {
                calls += 1;
                Ok(Slot::local(SlotKind::Object, 1))
            })
            .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(data.slots, vec![Slot::local(SlotKind::Object, 1)]);
        assert_eq!(
            data.body,
            r#"[{"@qclass":"slot","iface":"Thing","index":0},{"@qclass":"slot","iface":"Thing","index":0}]"#
        );

        let mut lookups = Vec::new();
        let back = JsonMarshal
            .unserialize(&data, &mut |slot, iface| {
                lookups.push((slot, iface.map(str::to_owned)));
                Ok(cap.clone())
            })
            .unwrap();
        assert_eq!(back, v);
        assert_eq!(
            lookups,
            vec![(Slot::local(SlotKind::Object, 1), Some("Thing".to_owned()))]
        );
    }

    #[test]
    fn reserved_and_malformed_inputs_fail() {
        let v = Value::record([(QCLASS, Value::Null)]);
        assert!(to_capdata(&JsonMarshal, &v).is_err());

        let bad = CapData {
            body: r#"{"@qclass":"slot","index":3}"#.to_owned(),
            slots: vec![],
        };
        assert!(matches!(
            from_capdata(&JsonMarshal, &bad),
            Err(CapTpError::Marshal(_))
        ));
    }
}
