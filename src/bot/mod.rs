use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::db::DBLayer;

const POLL_TIMEOUT_SECS: u64 = 30;

/// Operator commands against the device registry.
#[derive(Debug, PartialEq)]
pub enum Command {
    SetStatus { sn: String, status: String },
    Remove { sn: String },
    Ping,
    Uptime,
    Usage(&'static str),
}

/// Parses an operator message. Wrong argument counts answer with usage help;
/// unknown text is ignored entirely.
pub fn parse_command(text: &str) -> Option<Command> {
    let mut parts = text.split_whitespace();
    let head = parts.next()?;
    // strip the bot mention from group-style commands (/remove@SomeBot)
    let name = head.split('@').next().unwrap_or(head);
    let args: Vec<&str> = parts.collect();

    match name {
        "/setstatus" => Some(match args.as_slice() {
            [sn, status] => Command::SetStatus {
                sn: sn.to_string(),
                status: status.to_string(),
            },
            _ => Command::Usage("Usage: /setstatus <SN> <STATUS>"),
        }),
        "/remove" => Some(match args.as_slice() {
            [sn] => Command::Remove { sn: sn.to_string() },
            _ => Command::Usage("Usage: /remove <SN>"),
        }),
        "/ping" => Some(Command::Ping),
        "/uptime" => Some(Command::Uptime),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    text: Option<String>,
    chat: IncomingChat,
}

#[derive(Debug, Deserialize)]
struct IncomingChat {
    id: i64,
}

pub struct OperatorBot {
    client: reqwest::Client,
    token: String,
    chat_id: String,
    db: Arc<DBLayer>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl OperatorBot {
    pub fn new(token: String, chat_id: String, db: Arc<DBLayer>) -> Result<Self> {
        // long poll holds the connection open for POLL_TIMEOUT_SECS
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()?;
        Ok(Self {
            client,
            token,
            chat_id,
            db,
            started_at: chrono::Utc::now(),
        })
    }

    /// Long-polls Telegram for operator commands; never returns.
    pub async fn run(self) {
        tracing::info!("operator bot polling started");
        let mut offset = 0i64;

        loop {
            match self.fetch_updates(offset).await {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Some(msg) = update.message {
                            self.handle_message(msg).await;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("operator bot poll failed: {err}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn fetch_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let url = format!("https://api.telegram.org/bot{}/getUpdates", self.token);
        let resp: UpdatesResponse = self
            .client
            .get(&url)
            .query(&[("offset", offset), ("timeout", POLL_TIMEOUT_SECS as i64)])
            .send()
            .await?
            .json()
            .await?;
        if !resp.ok {
            anyhow::bail!("telegram getUpdates answered ok=false");
        }
        Ok(resp.result)
    }

    async fn handle_message(&self, msg: IncomingMessage) {
        // only the configured operator chat may issue commands
        if msg.chat.id.to_string() != self.chat_id {
            return;
        }
        let Some(command) = msg.text.as_deref().and_then(parse_command) else {
            return;
        };
        let reply = self.execute(command).await;
        self.reply(msg.chat.id, &reply).await;
    }

    async fn execute(&self, command: Command) -> String {
        match command {
            Command::SetStatus { sn, status } => match self.db.set_status(&sn, &status).await {
                Ok(true) => format!("✅ Status of {sn} updated to {status}"),
                Ok(false) => format!("❌ Device {sn} not found."),
                Err(err) => {
                    tracing::error!("setstatus failed for {sn}: {err}");
                    format!("⚠️ Error updating status of {sn}")
                }
            },
            Command::Remove { sn } => match self.db.delete_device(&sn).await {
                Ok(true) => format!("✅ Removed device {sn}"),
                Ok(false) => format!("❌ Device {sn} not found."),
                Err(err) => {
                    tracing::error!("remove failed for {sn}: {err}");
                    format!("⚠️ Error removing device {sn}")
                }
            },
            Command::Ping => "pong".to_string(),
            Command::Uptime => format!(
                "🕒 Up since {} (now {})",
                self.started_at.format("%Y-%m-%d %H:%M:%S"),
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
            ),
            Command::Usage(text) => text.to_string(),
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let result = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await;
        if let Err(err) = result {
            tracing::warn!("operator reply failed: {err}");
        }
    }
}
