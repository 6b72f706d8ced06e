//! A minimal hand-rolled JSON-schema subset validator: `type`, `required`,
//! and `properties` only. Mirrors the expression engine's choice of a small
//! purpose-built parser over pulling in a general schema-validation crate
//! (§4.3, §4.4).

use serde_json::Value as Json;

pub fn validate(schema: &Json, value: &Json) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected_type) = schema_obj.get("type").and_then(Json::as_str) {
        if !matches_type(expected_type, value) {
            return Err(format!(
                "expected type '{expected_type}', got '{}'",
                json_type_name(value)
            ));
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Json::as_object) {
        let value_obj = value.as_object();
        let required: Vec<&str> = schema_obj
            .get("required")
            .and_then(Json::as_array)
            .map(|arr| arr.iter().filter_map(Json::as_str).collect())
            .unwrap_or_default();

        for name in &required {
            let present = value_obj.map(|o| o.contains_key(*name)).unwrap_or(false);
            if !present {
                return Err(format!("missing required property '{name}'"));
            }
        }

        for (name, sub_schema) in properties {
            if let Some(field_value) = value_obj.and_then(|o| o.get(name)) {
                validate(sub_schema, field_value)?;
            }
        }
    }

    Ok(())
}

fn matches_type(expected: &str, value: &Json) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_object() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["name"],
            "properties": { "name": { "type": "string" } }
        });
        let value = serde_json::json!({ "name": "ok" });
        assert!(validate(&schema, &value).is_ok());
    }

    #[test]
    fn rejects_missing_required_property() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["name"],
            "properties": { "name": { "type": "string" } }
        });
        let value = serde_json::json!({});
        assert!(validate(&schema, &value).is_err());
    }

    #[test]
    fn rejects_type_mismatch() {
        let schema = serde_json::json!({ "type": "number" });
        let value = serde_json::json!("not a number");
        assert!(validate(&schema, &value).is_err());
    }

    #[test]
    fn recurses_into_nested_properties() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "inner": { "type": "object", "required": ["x"], "properties": { "x": { "type": "number" } } }
            }
        });
        let value = serde_json::json!({ "inner": { "x": "wrong type" } });
        assert!(validate(&schema, &value).is_err());
    }
}
