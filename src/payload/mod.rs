use serde_json::{Map, Value};

/// Identity and auxiliary data extracted from a decrypted check-in payload.
#[derive(Debug, Default, PartialEq)]
pub struct CheckinFields {
    pub sn: Option<String>,
    pub imei: Option<String>,
    pub aux: Map<String, Value>,
}

impl CheckinFields {
    pub fn is_empty(&self) -> bool {
        self.sn.is_none() && self.imei.is_none() && self.aux.is_empty()
    }
}

// Common casings checked first, in order; any other casing is picked up by
// the case-insensitive fallback scan.
const SN_KEYS: &[&str] = &["SN", "sn", "Sn"];
const IMEI_KEYS: &[&str] = &["IMEI", "Imei", "imei"];
const AUX_PREFIX: &str = "ST";

/// Interprets decrypted plaintext as a JSON object and pulls out the device
/// identifiers plus every `ST*`-prefixed auxiliary field.
///
/// Anything that is not a JSON object yields an empty field set — the
/// endpoint still answers with the raw plaintext, so parsing never fails a
/// check-in outright.
pub fn parse(plaintext: &[u8]) -> CheckinFields {
    let doc = match serde_json::from_slice::<Value>(plaintext) {
        Ok(Value::Object(map)) => map,
        _ => return CheckinFields::default(),
    };

    let aux = doc
        .iter()
        .filter(|(key, _)| key.to_ascii_uppercase().starts_with(AUX_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    CheckinFields {
        sn: pick_identifier(&doc, SN_KEYS),
        imei: pick_identifier(&doc, IMEI_KEYS),
        aux,
    }
}

fn pick_identifier(doc: &Map<String, Value>, candidates: &[&str]) -> Option<String> {
    for key in candidates {
        if let Some(value) = doc.get(*key) {
            if let Some(s) = identifier_string(value) {
                return Some(s);
            }
        }
    }
    doc.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(candidates[0]))
        .and_then(|(_, value)| identifier_string(value))
}

// Identifiers arrive as strings or bare numbers; everything else is ignored.
fn identifier_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
