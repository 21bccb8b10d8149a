use tokio::sync::mpsc;

const QUEUE_SIZE: usize = 64;

/// Fire-and-forget operator notifications over Telegram.
///
/// Messages go through a bounded channel drained by one delivery task, so
/// the request path never waits on the Telegram API. When the queue is full
/// or the sink is disabled the message is dropped; delivery is best effort
/// by contract.
#[derive(Clone)]
pub struct Notifier {
    tx: Option<mpsc::Sender<String>>,
}

impl Notifier {
    pub fn from_env() -> Self {
        let token = dotenvy::var("TELEGRAM_BOT_TOKEN").ok();
        let chat_id = dotenvy::var("TELEGRAM_CHAT_ID").ok();
        match (token, chat_id) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                Self::start(token, chat_id)
            }
            _ => {
                tracing::warn!("TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID not set, notifications disabled");
                Self::disabled()
            }
        }
    }

    pub fn start(token: String, chat_id: String) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        tokio::spawn(delivery_loop(rx, token, chat_id));
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Enqueues a message without blocking; drops it when the queue is full.
    pub fn notify(&self, message: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.try_send(message.into()) {
            tracing::warn!("operator notification dropped: {err}");
        }
    }
}

async fn delivery_loop(mut rx: mpsc::Receiver<String>, token: String, chat_id: String) {
    let client = reqwest::Client::new();
    let url = format!("https://api.telegram.org/bot{token}/sendMessage");

    while let Some(text) = rx.recv().await {
        let result = client
            .post(&url)
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!("telegram rejected notification: {}", resp.status());
            }
            Err(err) => tracing::warn!("telegram delivery failed: {err}"),
            _ => {}
        }
    }
}
