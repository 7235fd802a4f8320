//! JSON <-> JavaScript value conversions
//!
//! Arguments arrive as JSON from the wire and must cross into Boa; results
//! cross back out. Conversion rules:
//!
//! | JSON | JavaScript |
//! |------|------------|
//! | null | null |
//! | boolean | Boolean |
//! | number | Number |
//! | string | String |
//! | array | Array |
//! | object | Object |
//!
//! Coming back, `undefined` and symbols flatten to JSON null, functions have
//! no JSON form, and objects with a callable `toJSON` (Dates) serialize
//! through it.

use boa_engine::object::builtins::JsArray;
use boa_engine::property::PropertyKey;
use boa_engine::{js_string, Context, JsObject, JsValue};
use serde_json::Value;

use filebase_common::{FilebaseError, Result};

fn conversion_error(message: impl Into<String>) -> FilebaseError {
    FilebaseError::invocation("conversion", message)
}

/// Converts a JSON value to a Boa value.
pub fn json_to_js(json: &Value, ctx: &mut Context) -> Result<JsValue> {
    match json {
        Value::Null => Ok(JsValue::null()),
        Value::Bool(b) => Ok(JsValue::new(*b)),
        Value::Number(n) => n
            .as_f64()
            .map(JsValue::new)
            .ok_or_else(|| conversion_error("number out of range")),
        Value::String(s) => Ok(JsValue::new(js_string!(s.clone()))),
        Value::Array(items) => {
            let array = JsArray::new(ctx);
            for item in items {
                let element = json_to_js(item, ctx)?;
                array
                    .push(element, ctx)
                    .map_err(|e| conversion_error(format!("array push failed: {}", e)))?;
            }
            Ok(array.into())
        }
        Value::Object(map) => {
            let object = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in map {
                let element = json_to_js(value, ctx)?;
                object
                    .create_data_property_or_throw(js_string!(key.clone()), element, ctx)
                    .map_err(|e| conversion_error(format!("set property '{}' failed: {}", key, e)))?;
            }
            Ok(object.into())
        }
    }
}

/// Converts a Boa value to a JSON value.
pub fn js_to_json(value: &JsValue, ctx: &mut Context) -> Result<Value> {
    if value.is_undefined() || value.is_null() {
        return Ok(Value::Null);
    }
    if let Some(b) = value.as_boolean() {
        return Ok(Value::Bool(b));
    }
    if let Some(i) = value.as_number().and_then(|n| {
        (n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64).then_some(n as i32)
    }) {
        return Ok(Value::Number(i.into()));
    }
    if let Some(n) = value.as_number() {
        return serde_json::Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| conversion_error("non-finite number"));
    }
    if let Some(s) = value.as_string() {
        return Ok(Value::String(s.to_std_string().map_err(|e| {
            conversion_error(format!("string conversion failed: {:?}", e))
        })?));
    }

    if let Some(object) = value.as_object() {
        let object = object.clone();

        if !object.is_callable() {
            // Dates (and anything else with a toJSON) serialize through it
            let to_json = object
                .get(js_string!("toJSON"), ctx)
                .map_err(|e| conversion_error(format!("toJSON lookup failed: {}", e)))?;
            if let Some(f) = to_json.as_object() {
                if f.is_callable() {
                    let out = f
                        .call(value, &[], ctx)
                        .map_err(|e| conversion_error(format!("toJSON call failed: {}", e)))?;
                    return js_to_json(&out, ctx);
                }
            }
        }

        if object.is_array() {
            let array = JsArray::from_object(object)
                .map_err(|e| conversion_error(format!("not a valid array: {}", e)))?;
            let length: usize = array
                .length(ctx)
                .map_err(|e| conversion_error(format!("array length failed: {}", e)))?
                .try_into()
                .map_err(|_| conversion_error("array length overflow"))?;
            let mut items = Vec::with_capacity(length);
            for i in 0..length {
                let element = array
                    .get(i, ctx)
                    .map_err(|e| conversion_error(format!("array index {} failed: {}", i, e)))?;
                items.push(js_to_json(&element, ctx)?);
            }
            return Ok(Value::Array(items));
        }

        if object.is_callable() {
            // Functions have no JSON form
            return Ok(Value::Null);
        }

        let keys = object
            .own_property_keys(ctx)
            .map_err(|e| conversion_error(format!("key enumeration failed: {}", e)))?;
        let mut map = serde_json::Map::new();
        for key in keys {
            let name = match &key {
                PropertyKey::String(s) => s
                    .to_std_string()
                    .map_err(|e| conversion_error(format!("key conversion failed: {:?}", e)))?,
                PropertyKey::Index(i) => i.get().to_string(),
                PropertyKey::Symbol(_) => continue,
            };
            let prop = object
                .get(key, ctx)
                .map_err(|e| conversion_error(format!("property '{}' failed: {}", name, e)))?;
            map.insert(name, js_to_json(&prop, ctx)?);
        }
        return Ok(Value::Object(map));
    }

    // Symbols and anything else without a JSON representation
    Ok(Value::Null)
}
