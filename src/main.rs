use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod bot;
mod crypto;
mod db;
mod model;
mod notify;
mod payload;

use api::AppState;
use bot::OperatorBot;
use crypto::SealedCodec;
use db::DBLayer;
use notify::Notifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("🚀 Starting device check-in server...");

    let notifier = Notifier::from_env();

    // Key load failure must not kill the process: an unconfigured codec
    // answers every check-in with the key-missing sentinel instead.
    let codec = match dotenvy::var("SERVER_PRIVATE_KEY") {
        Ok(encoded) => match SealedCodec::from_base64(&encoded) {
            Ok(codec) => {
                if let Some(pk) = codec.public_key_b64() {
                    tracing::info!("server public key: {pk}");
                }
                codec
            }
            Err(err) => {
                tracing::error!("SERVER_PRIVATE_KEY is malformed: {err}");
                notifier.notify("🚨 SERVER_PRIVATE_KEY is malformed, check-ins will fail");
                SealedCodec::unconfigured()
            }
        },
        Err(_) => {
            tracing::warn!("SERVER_PRIVATE_KEY not set, check-ins will fail");
            SealedCodec::unconfigured()
        }
    };

    let db_path = dotenvy::var("DEVICE_DB_PATH").unwrap_or_else(|_| "devicedb".to_string());
    let db = Arc::new(DBLayer::new(&db_path)?);

    // Operator command channel (optional, needs bot credentials).
    match (
        dotenvy::var("TELEGRAM_BOT_TOKEN"),
        dotenvy::var("TELEGRAM_CHAT_ID"),
    ) {
        (Ok(token), Ok(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
            let bot = OperatorBot::new(token, chat_id, db.clone())?;
            tokio::spawn(bot.run());
        }
        _ => tracing::warn!("operator bot disabled, no TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID"),
    }

    let state = AppState {
        db,
        codec: Arc::new(codec),
        notifier: notifier.clone(),
        strict_errors: env_flag("CHECKIN_STRICT_ERRORS"),
        notify_checkins: env_flag("CHECKIN_NOTIFY"),
    };

    let app = Router::new()
        .merge(api::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state);

    let port = dotenvy::var("PORT").unwrap_or_else(|_| "3618".to_string());
    let addr = format!("0.0.0.0:{port}");

    println!("🌐 HTTP listening on http://{addr}");
    notifier.notify(format!(
        "🚀 Check-in server started at {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ));

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

fn env_flag(name: &str) -> bool {
    dotenvy::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
