use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};

use crate::{
    crypto::{CodecError, SealedCodec},
    db::DBLayer,
    notify::Notifier,
    payload,
};

/// Sentinel status: server has no usable private key.
pub const STATUS_KEY_MISSING: i64 = 70;
/// Sentinel status: ciphertext rejected or internal failure.
pub const STATUS_DECRYPT_FAILED: i64 = 77;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DBLayer>,
    pub codec: Arc<SealedCodec>,
    pub notifier: Notifier,
    /// Alternative response contract: sentinel failures become transport errors.
    pub strict_errors: bool,
    /// Post a summary of every successful check-in to the operator channel.
    pub notify_checkins: bool,
}

pub async fn checkin(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    handle_checkin(&state, &params, content_type.as_deref(), &body).await
}

/// ReceiveInput → LocateCiphertext → Decode → Parse → Reconcile → Respond.
pub(crate) async fn handle_checkin(
    state: &AppState,
    params: &HashMap<String, String>,
    content_type: Option<&str>,
    body: &[u8],
) -> (StatusCode, Json<Value>) {
    let Some(ciphertext) = locate_ciphertext(content_type, body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "no ciphertext supplied" })),
        );
    };

    let plaintext = match state.codec.decrypt_b64(&ciphertext) {
        Ok(bytes) => bytes,
        Err(CodecError::Configuration) => {
            tracing::error!("check-in rejected: server private key not configured");
            state
                .notifier
                .notify("🚨 Check-in rejected: server private key is not configured");
            return failure(state, STATUS_KEY_MISSING, StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(CodecError::Decryption) => {
            tracing::warn!("check-in rejected: ciphertext failed to decrypt");
            state
                .notifier
                .notify("🚨 Check-in rejected: ciphertext failed to decrypt");
            return failure(state, STATUS_DECRYPT_FAILED, StatusCode::BAD_REQUEST);
        }
    };

    // Parse failure is not terminal: the caller still gets the plaintext back.
    let text = String::from_utf8_lossy(&plaintext).into_owned();
    let fields = payload::parse(&plaintext);

    // Out-of-band identifier only when the payload itself had none.
    let sn = fields
        .sn
        .clone()
        .or_else(|| params.get("sn").map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty());

    let Some(sn) = sn else {
        return (
            StatusCode::OK,
            Json(json!({ "status": "unknown", "plaintext": text })),
        );
    };

    let imei = fields.imei.as_deref().filter(|s| !s.is_empty());
    match state.db.upsert_device(&sn, imei, &fields.aux).await {
        Ok(device) => {
            tracing::info!(sn = %sn, "device check-in");
            if state.notify_checkins {
                let mut msg = format!("Device check-in\nSN: {sn}");
                if let Some(imei) = imei {
                    msg.push_str(&format!("\nIMEI: {imei}"));
                }
                if !fields.aux.is_empty() {
                    msg.push_str(&format!("\nST fields: {}", fields.aux.len()));
                }
                state.notifier.notify(msg);
            }
            (
                StatusCode::OK,
                Json(json!({ "status": device.status, "sn": sn, "plaintext": text })),
            )
        }
        Err(err) => {
            tracing::error!("device upsert failed for {sn}: {err}");
            state
                .notifier
                .notify(format!("🚨 Device upsert failed for {sn}"));
            failure(
                state,
                STATUS_DECRYPT_FAILED,
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    }
}

// Primary contract answers 200 with a sentinel body; the strict variant maps
// the sentinel to a transport error instead.
fn failure(state: &AppState, sentinel: i64, strict: StatusCode) -> (StatusCode, Json<Value>) {
    let code = if state.strict_errors {
        strict
    } else {
        StatusCode::OK
    };
    (code, Json(json!({ "status": sentinel })))
}

/// Ciphertext carriers in priority order: JSON field `data`, then
/// `ciphertext_b64`; the same form fields; finally the raw body as text.
/// First present, non-empty source wins.
fn locate_ciphertext(content_type: Option<&str>, body: &[u8]) -> Option<String> {
    const FIELDS: [&str; 2] = ["data", "ciphertext_b64"];
    let content_type = content_type.unwrap_or("");

    if let Ok(Value::Object(doc)) = serde_json::from_slice::<Value>(body) {
        for field in FIELDS {
            if let Some(Value::String(s)) = doc.get(field) {
                if !s.trim().is_empty() {
                    return Some(s.trim().to_string());
                }
            }
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        if let Ok(form) = serde_urlencoded::from_bytes::<HashMap<String, String>>(body) {
            for field in FIELDS {
                if let Some(s) = form.get(field) {
                    if !s.trim().is_empty() {
                        return Some(s.trim().to_string());
                    }
                }
            }
        }
    }

    let raw = std::str::from_utf8(body).ok()?.trim();
    (!raw.is_empty()).then(|| raw.to_string())
}

/// Plaintext status query: no decryption, just a registry read.
pub async fn device_status(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let Some(sn) = params.get("sn").map(|s| s.trim()).filter(|s| !s.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "sn required" })),
        );
    };

    match state.db.load_device(sn).await {
        Ok(Some(device)) => (
            StatusCode::OK,
            Json(json!({ "sn": device.sn, "status": device.status })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "sn": sn, "error": "not_found" })),
        ),
        Err(err) => {
            tracing::error!("status lookup failed for {sn}: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            )
        }
    }
}

/// Legacy plaintext check-in: `sn`/`imei`/`stid` as query, form, or JSON
/// fields, no encryption. Answers with the device status as plain text.
pub async fn healthy(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let mut fields: HashMap<String, String> = params.clone();
    if content_type.starts_with("application/x-www-form-urlencoded") {
        if let Ok(form) = serde_urlencoded::from_bytes::<HashMap<String, String>>(&body) {
            for (k, v) in form {
                fields.entry(k).or_insert(v);
            }
        }
    } else if let Ok(Value::Object(doc)) = serde_json::from_slice::<Value>(&body) {
        for (k, v) in doc {
            if let Value::String(s) = v {
                fields.entry(k).or_insert(s);
            }
        }
    }

    let pick = |key: &str| {
        fields
            .get(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let Some(sn) = pick("sn") else {
        return (StatusCode::OK, "Service is running".to_string());
    };

    let mut aux = serde_json::Map::new();
    if let Some(stid) = pick("stid") {
        aux.insert("stid".to_string(), Value::String(stid));
    }

    match state
        .db
        .upsert_device(&sn, pick("imei").as_deref(), &aux)
        .await
    {
        Ok(device) => {
            tracing::info!(sn = %sn, "plaintext check-in");
            if state.notify_checkins {
                state.notifier.notify(format!("Device request\nSN: {sn}"));
            }
            (StatusCode::OK, device.status)
        }
        Err(err) => {
            tracing::error!("plaintext check-in failed for {sn}: {err}");
            state
                .notifier
                .notify(format!("🚨 Internal processing error for {sn}"));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Processing Error".to_string(),
            )
        }
    }
}

/// Registry dump for operators, newest first.
pub async fn list_devices(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.db.list_devices().await {
        Ok(devices) => (StatusCode::OK, Json(json!({ "devices": devices }))),
        Err(err) => {
            tracing::error!("device listing failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            )
        }
    }
}
