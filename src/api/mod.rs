use axum::{
    routing::{get, post},
    Router,
};

pub mod handlers;

pub use handlers::AppState;
use handlers::{checkin, device_status, healthy, list_devices};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/checkin", post(checkin))
        .route("/status", get(device_status))
        .route("/healthy", get(healthy).post(healthy))
        .route("/internal/devices", get(list_devices))
}
