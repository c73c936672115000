mod album;
mod broadcast;
mod cli;
mod config;
mod daemon;
mod db;
mod error;
mod filler;
mod lifecycle;
mod locks;
mod messenger;
mod models;
mod recover;
mod scheduler;
mod store;
mod telegram;
mod tg_session;
mod timers;
mod window;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands, TgCommands};
use crate::config::{load_config, validate_config};
use crate::models::{BroadcastMode, ContentPayload};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.crier.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    match cli.command {
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
        }
        Some(Commands::Post {
            text,
            at,
            chats,
            unpin_after,
            delete_after,
            media_refs,
        }) => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            let tz = config.timezone();

            let scheduled_at = parse_local_datetime(&at, tz)?;
            let unpin_at = offset_from(scheduled_at, unpin_after.as_deref())?;
            let delete_at = offset_from(scheduled_at, delete_after.as_deref())?;

            let payload = payload_from_args(text, media_refs)?;
            let destinations: Vec<store::DestinationSpec> = chats
                .into_iter()
                .map(|chat_id| store::DestinationSpec {
                    chat_id,
                    unpin_at,
                    delete_at,
                })
                .collect();

            let id = store::create_post(&pool, &payload, scheduled_at, &destinations)
                .await
                .context("creating post")?;
            println!("Scheduled post {id} for {} chat(s) at {at}.", destinations.len());
        }
        Some(Commands::Broadcast {
            text,
            chat,
            every,
            starting,
            until,
            window,
            limited,
            media_refs,
        }) => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            let tz = config.timezone();

            let (window_start_min, window_end_min) = match window.as_deref() {
                Some(spec) => {
                    let (start, end) = parse_window(spec)?;
                    (Some(start), Some(end))
                }
                None => (None, None),
            };

            let payload = payload_from_args(text, media_refs)?;
            let spec = store::BroadcastSpec {
                chat_id: chat,
                interval_minutes: every,
                next_run_at: parse_local_datetime(&starting, tz)?,
                end_at: parse_local_datetime(&until, tz)?,
                mode: if limited || window_start_min.is_some() {
                    BroadcastMode::Limited
                } else {
                    BroadcastMode::Full
                },
                window_start_min,
                window_end_min,
            };

            let id = store::create_broadcast(&pool, &payload, &spec)
                .await
                .context("creating broadcast")?;
            println!("Created broadcast {id}: every {every} min until {until}.");
        }
        Some(Commands::Pending { text, chat, media_refs }) => {
            let chat_id = chat.or(config.crier.primary_chat).context(
                "no destination: pass --chat or set crier.primary_chat in config",
            )?;

            let pool = db::create_pool(&config).await.context("creating database")?;
            let payload = payload_from_args(text, media_refs)?;
            let id = store::create_pending_post(&pool, &payload, chat_id)
                .await
                .context("queueing pending post")?;
            println!("Queued pending post {id} for chat {chat_id}.");
        }
        Some(Commands::Tg { command }) => {
            // Validate telegram config
            match config.telegram.api_id {
                None | Some(0) => {
                    anyhow::bail!(
                        "Telegram requires a valid [telegram].api_id in config \
                         (get one at https://my.telegram.org)"
                    );
                }
                _ => {}
            }
            if config.telegram.api_hash.as_deref().is_none_or(|h| h.is_empty()) {
                anyhow::bail!(
                    "Telegram requires a valid [telegram].api_hash in config \
                     (get one at https://my.telegram.org)"
                );
            }

            let pool = db::create_pool(&config).await.context("creating database")?;
            let conn = telegram::connect(&config, &pool)
                .await
                .context("connecting to Telegram")?;

            match command {
                TgCommands::Login => {
                    telegram::login(&conn.client, &config).await.context("Telegram login")?;
                    println!("Session saved. The daemon can now publish to your chats.");
                }
                TgCommands::Status => {
                    telegram::status(&conn.client).await.context("Telegram status")?;
                }
            }

            // Disconnect cleanly
            conn.client.disconnect();
            conn.runner_handle.abort();
        }
        None => {
            daemon::run(config).await?;
        }
    }

    Ok(())
}

/// Parse "YYYY-MM-DD HH:MM" in the configured timezone.
fn parse_local_datetime(s: &str, tz: Tz) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .with_context(|| format!("invalid time '{s}': expected YYYY-MM-DD HH:MM"))?;
    let local = tz
        .from_local_datetime(&naive)
        .earliest()
        .with_context(|| format!("time '{s}' does not exist in timezone {tz}"))?;
    Ok(local.with_timezone(&Utc))
}

/// "HH:MM-HH:MM" to window bounds in minutes since midnight.
fn parse_window(spec: &str) -> Result<(i64, i64)> {
    let (start, end) = spec
        .split_once('-')
        .with_context(|| format!("invalid window '{spec}': expected HH:MM-HH:MM"))?;
    let start = config::parse_hhmm_minutes(start.trim())
        .with_context(|| format!("invalid window start in '{spec}'"))?;
    let end = config::parse_hhmm_minutes(end.trim())
        .with_context(|| format!("invalid window end in '{spec}'"))?;
    Ok((start, end))
}

fn offset_from(base: DateTime<Utc>, offset: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(offset) = offset else { return Ok(None) };
    let duration = humantime::parse_duration(offset).with_context(|| format!("invalid duration '{offset}'"))?;
    let duration = chrono::Duration::from_std(duration).with_context(|| format!("duration '{offset}' out of range"))?;
    Ok(Some(base + duration))
}

fn payload_from_args(text: Option<String>, media_refs: Vec<String>) -> Result<ContentPayload> {
    let payload = if media_refs.is_empty() {
        ContentPayload::Text {
            body: text.unwrap_or_default(),
        }
    } else {
        ContentPayload::Photo {
            media_refs,
            caption: text.filter(|t| !t.is_empty()),
        }
    };
    // Reject empty content up front
    let (content_type, body, refs) = payload.to_columns();
    ContentPayload::from_columns(content_type, body.as_deref(), &refs)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_datetime_in_tz() {
        let t = parse_local_datetime("2026-08-01 12:00", chrono_tz::Europe::Moscow).expect("parse");
        // Moscow is UTC+3
        assert_eq!(t, "2026-08-01T09:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert!(parse_local_datetime("yesterday-ish", chrono_tz::UTC).is_err());
    }

    #[test]
    fn parses_window_spec() {
        assert_eq!(parse_window("09:00-23:00").expect("parse"), (540, 1380));
        assert_eq!(parse_window("23:00-02:00").expect("parse"), (1380, 120));
        assert!(parse_window("9-23").is_err());
    }

    #[test]
    fn rejects_empty_cli_content() {
        assert!(payload_from_args(None, Vec::new()).is_err());
        assert!(payload_from_args(Some(String::new()), Vec::new()).is_err());
        assert!(payload_from_args(Some("hi".into()), Vec::new()).is_ok());
        assert!(payload_from_args(None, vec!["ref".into()]).is_ok());
    }
}
