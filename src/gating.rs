use std::collections::BTreeMap;

use crate::{config::MutatorConfig, Error};

/// Decides whether a pod gets the gateway.
///
/// The configured default applies first, then the gating label, then the gating
/// annotation, so an annotation always overrides a label when both are present.
pub fn should_mutate(
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
    config: &MutatorConfig,
) -> Result<bool, Error> {
    let mut result = config.gate_by_default;
    if let Some(x) = evaluate(labels, &config.gating_label, &config.gating_label_value)? {
        result = x;
    }
    if let Some(x) = evaluate(
        annotations,
        &config.gating_annotation,
        &config.gating_annotation_value,
    )? {
        result = x;
    }
    Ok(result)
}

fn evaluate(
    values: &BTreeMap<String, String>,
    key: &str,
    required: &str,
) -> Result<Option<bool>, Error> {
    if key.is_empty() {
        return Ok(None);
    }
    let Some(value) = values.get(key) else {
        return Ok(None);
    };
    if !required.is_empty() {
        return Ok(Some(value == required));
    }
    parse_bool(value).map(Some).ok_or_else(|| Error::ValueParse {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Accepts the same literals as Go's `strconv.ParseBool`, which operators already use.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
