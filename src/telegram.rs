use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use grammers_client::{Client, InputMessage, SenderPool, SignInError};
use grammers_mtsender::ConnectionParams;
use grammers_session::types::{PeerAuth, PeerId, PeerRef};
use grammers_tl_types::{self as tl, Deserializable, Serializable};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::TelegramError;
use crate::messenger::Messenger;
use crate::models::ContentPayload;
use crate::tg_session::SqlxSession;

/// Holds a connected grammers client and its background runner handle.
pub struct TgConnection {
    pub client: Client,
    pub runner_handle: tokio::task::JoinHandle<()>,
}

/// Create a grammers Client connected to Telegram.
pub async fn connect(config: &Config, pool: &SqlitePool) -> Result<TgConnection> {
    let api_id = config
        .telegram
        .api_id
        .ok_or_else(|| TelegramError::Connection("api_id not configured".to_string()))?;

    info!("loading Telegram session from database");

    let session = Arc::new(
        SqlxSession::load(pool.clone())
            .await
            .map_err(|e| TelegramError::Connection(format!("failed to load session: {e}")))?,
    );

    let sender_pool = SenderPool::with_configuration(
        session as Arc<SqlxSession>,
        api_id,
        ConnectionParams {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            device_model: "crier".to_string(),
            ..Default::default()
        },
    );

    let SenderPool {
        runner,
        handle: fat_handle,
        updates: _updates,
    } = sender_pool;

    let client = Client::new(fat_handle);

    // Spawn the sender pool runner (drives all MTProto I/O)
    let runner_handle = tokio::spawn(async move {
        runner.run().await;
    });

    Ok(TgConnection { client, runner_handle })
}

/// Interactive login flow (phone -> code -> optional 2FA).
pub async fn login(client: &Client, config: &Config) -> Result<()> {
    let api_hash = config
        .telegram
        .api_hash
        .as_deref()
        .ok_or_else(|| TelegramError::Connection("api_hash not configured".to_string()))?;

    if client.is_authorized().await.unwrap_or(false) {
        let me = client.get_me().await.context("getting current user")?;
        println!(
            "Already logged in as {} (@{})",
            me.full_name(),
            me.username().unwrap_or("no username")
        );
        return Ok(());
    }

    print!("Phone number (with country code, e.g. +7...): ");
    std::io::stdout().flush()?;
    let mut phone = String::new();
    std::io::stdin().read_line(&mut phone)?;
    let phone = phone.trim().to_string();

    let token = client.request_login_code(&phone, api_hash).await.map_err(|e| {
        let msg = e.to_string();
        if msg.contains("API_ID_INVALID") || msg.contains("CONNECTION_API_ID_INVALID") {
            anyhow::anyhow!(
                "invalid Telegram API credentials. Check [telegram].api_id and api_hash in config.toml \
                     (get valid credentials at https://my.telegram.org)"
            )
        } else {
            anyhow::anyhow!(e).context("requesting login code")
        }
    })?;

    println!("Login code sent via Telegram.");
    print!("Enter code: ");
    std::io::stdout().flush()?;
    let mut code = String::new();
    std::io::stdin().read_line(&mut code)?;
    let code = code.trim();

    match client.sign_in(&token, code).await {
        Ok(user) => {
            println!(
                "Logged in as {} (@{})",
                user.full_name(),
                user.username().unwrap_or("no username")
            );
        }
        Err(SignInError::PasswordRequired(password_token)) => {
            let hint = password_token.hint().unwrap_or("none");
            println!("Two-factor authentication required (hint: {hint})");
            let password = rpassword::prompt_password_stdout("Enter 2FA password: ").context("reading 2FA password")?;

            let user = client
                .check_password(password_token, password.as_bytes())
                .await
                .map_err(|e| anyhow::anyhow!("2FA check failed: {e:?}"))?;

            println!(
                "Logged in as {} (@{})",
                user.full_name(),
                user.username().unwrap_or("no username")
            );
        }
        Err(SignInError::InvalidCode) => {
            anyhow::bail!("invalid verification code");
        }
        Err(other) => {
            anyhow::bail!("sign-in failed: {other:?}");
        }
    }

    Ok(())
}

/// Print session/connection status.
pub async fn status(client: &Client) -> Result<()> {
    match client.is_authorized().await {
        Ok(true) => {
            let me = client.get_me().await.context("getting current user")?;
            println!("Status: Connected");
            println!("  Name: {}", me.full_name());
            if let Some(username) = me.username() {
                println!("  Username: @{username}");
            }
        }
        Ok(false) => {
            println!("Status: Not authorized");
            println!("  Run 'crier tg login' to authenticate.");
        }
        Err(e) => {
            println!("Status: Connection error");
            println!("  Error: {e}");
        }
    }
    Ok(())
}

// ── Peer resolution ────────────────────────────────────────────────────

/// Map a bot-api style dialog id onto a grammers peer id.
/// `-100xxxxxxxxxx` is a channel/supergroup, other negatives are basic
/// groups, positives are users.
fn peer_id_for_dialog(dialog_id: i64) -> PeerId {
    const CHANNEL_OFFSET: i64 = 1_000_000_000_000;
    if dialog_id <= -CHANNEL_OFFSET {
        PeerId::channel(-(dialog_id + CHANNEL_OFFSET))
    } else if dialog_id < 0 {
        PeerId::chat(-dialog_id)
    } else {
        PeerId::user(dialog_id)
    }
}

/// Resolve a destination dialog id to a PeerRef using the session peer cache.
/// Falls back to access hash 0 when the peer was never seen; public channels
/// still accept that.
async fn resolve_peer_ref(pool: &SqlitePool, dialog_id: i64) -> Result<PeerRef> {
    let id = peer_id_for_dialog(dialog_id);
    let hash: Option<i64> = sqlx::query_scalar("SELECT hash FROM tg_peer WHERE peer_id = ?")
        .bind(dialog_id)
        .fetch_optional(pool)
        .await
        .context("looking up peer access hash")?
        .flatten();

    if hash.is_none() {
        warn!(dialog_id, "peer not in session cache, using zero access hash");
    }

    Ok(PeerRef {
        id,
        auth: PeerAuth::from_hash(hash.unwrap_or(0)),
    })
}

// ── Opaque media references ────────────────────────────────────────────

/// Encode already-uploaded Telegram media as an opaque string for storage.
/// The intake surface calls this when an admin submits a photo or album.
pub fn encode_media_ref(media: &tl::enums::InputMedia) -> String {
    BASE64.encode(media.to_bytes())
}

/// Decode an opaque media reference back into sendable media.
pub fn decode_media_ref(media_ref: &str) -> Result<tl::enums::InputMedia> {
    let bytes = BASE64
        .decode(media_ref)
        .context("media reference is not valid base64")?;
    tl::enums::InputMedia::from_bytes(&bytes).context("media reference does not decode to media")
}

// ── Messenger implementation ───────────────────────────────────────────

/// Production `Messenger` backed by a grammers client. Peer access hashes
/// come from the session cache in the same database.
pub struct TelegramMessenger {
    client: Client,
    pool: SqlitePool,
}

impl TelegramMessenger {
    pub fn new(client: Client, pool: SqlitePool) -> Self {
        Self { client, pool }
    }

    async fn send_text(&self, peer: PeerRef, text: &str) -> Result<Vec<i64>> {
        let message = self
            .client
            .send_message(peer, InputMessage::text(text))
            .await
            .context("sending text message")?;
        Ok(vec![message.id() as i64])
    }
}

impl Messenger for TelegramMessenger {
    async fn send(&self, chat_id: i64, content: &ContentPayload) -> Result<Vec<i64>> {
        let peer = resolve_peer_ref(&self.pool, chat_id).await?;

        match content {
            ContentPayload::Text { body } => self.send_text(peer, body).await,
            ContentPayload::Photo { media_refs, caption } => {
                let mut parts = Vec::with_capacity(media_refs.len());
                for (i, media_ref) in media_refs.iter().enumerate() {
                    let media = decode_media_ref(media_ref)?;
                    // Caption rides on the first element only
                    let text = if i == 0 { caption.as_deref().unwrap_or("") } else { "" };
                    parts.push(InputMessage::text(text).media(media));
                }

                if parts.len() == 1 {
                    let message = self
                        .client
                        .send_message(peer, parts.remove(0))
                        .await
                        .context("sending photo")?;
                    Ok(vec![message.id() as i64])
                } else {
                    let messages = self
                        .client
                        .send_album(peer, parts)
                        .await
                        .context("sending album")?;
                    Ok(messages.into_iter().map(|m| m.id() as i64).collect())
                }
            }
        }
    }

    async fn pin(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let peer = resolve_peer_ref(&self.pool, chat_id).await?;
        self.client
            .pin_message(peer, message_id as i32)
            .await
            .with_context(|| format!("pinning message {message_id} in chat {chat_id}"))?;
        Ok(())
    }

    async fn unpin(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let peer = resolve_peer_ref(&self.pool, chat_id).await?;
        self.client
            .unpin_message(peer, message_id as i32)
            .await
            .with_context(|| format!("unpinning message {message_id} in chat {chat_id}"))?;
        Ok(())
    }

    async fn delete_messages(&self, chat_id: i64, message_ids: &[i64]) -> Result<()> {
        let peer = resolve_peer_ref(&self.pool, chat_id).await?;
        let ids: Vec<i32> = message_ids.iter().map(|&id| id as i32).collect();
        self.client
            .delete_messages(peer, &ids)
            .await
            .with_context(|| format!("deleting {} messages in chat {chat_id}", ids.len()))?;
        Ok(())
    }

    async fn notify(&self, chat_id: i64, text: &str) -> Result<()> {
        let peer = resolve_peer_ref(&self.pool, chat_id).await?;
        self.send_text(peer, text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialog_id_mapping() {
        assert_eq!(peer_id_for_dialog(-1001234567890), PeerId::channel(1234567890));
        assert_eq!(peer_id_for_dialog(-4567), PeerId::chat(4567));
        assert_eq!(peer_id_for_dialog(4242), PeerId::user(4242));
    }

    #[test]
    fn media_ref_roundtrip() {
        let media: tl::enums::InputMedia = tl::types::InputMediaPhoto {
            spoiler: false,
            id: tl::types::InputPhoto {
                id: 7,
                access_hash: 11,
                file_reference: vec![1, 2, 3],
            }
            .into(),
            ttl_seconds: None,
        }
        .into();

        let encoded = encode_media_ref(&media);
        let decoded = decode_media_ref(&encoded).expect("decode");
        assert_eq!(decoded, media);
    }

    #[test]
    fn rejects_garbage_media_ref() {
        assert!(decode_media_ref("not!!base64??").is_err());
    }
}
