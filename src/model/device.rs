use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status a record carries until an operator overrides it.
pub const DEFAULT_STATUS: &str = "0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub sn: String, // primary identifier, immutable once created
    pub imei: Option<String>,
    #[serde(default)]
    pub st_data: Map<String, Value>, // auxiliary ST* fields from the last check-in
    pub status: String, // operator-controlled, never written by check-ins
    pub updated_at: i64,
}

impl DeviceRecord {
    pub fn new(sn: &str) -> Self {
        Self {
            sn: sn.to_string(),
            imei: None,
            st_data: Map::new(),
            status: DEFAULT_STATUS.to_string(),
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}
