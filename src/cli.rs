use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "crier", about = "Channel crier — scheduled posts, pins, and broadcasts for Telegram chats")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Schedule a post for one or more chats
    Post {
        /// Message text (or album caption when media refs are given)
        text: Option<String>,

        /// Publication time, "YYYY-MM-DD HH:MM" in the configured timezone
        #[arg(long)]
        at: String,

        /// Destination chat id (repeatable)
        #[arg(long = "chat", required = true)]
        chats: Vec<i64>,

        /// Unpin this long after publication (e.g. "2days")
        #[arg(long)]
        unpin_after: Option<String>,

        /// Delete this long after publication (e.g. "7days")
        #[arg(long)]
        delete_after: Option<String>,

        /// Opaque media reference from an intake surface (repeatable)
        #[arg(long = "media-ref")]
        media_refs: Vec<String>,
    },

    /// Create a recurring broadcast for a single chat
    Broadcast {
        /// Message text (or album caption when media refs are given)
        text: Option<String>,

        /// Destination chat id
        #[arg(long)]
        chat: i64,

        /// Minutes between runs
        #[arg(long)]
        every: i64,

        /// First run, "YYYY-MM-DD HH:MM" in the configured timezone
        #[arg(long)]
        starting: String,

        /// Last possible run, "YYYY-MM-DD HH:MM" in the configured timezone
        #[arg(long)]
        until: String,

        /// Restrict runs to a daily window "HH:MM-HH:MM" (may wrap midnight);
        /// omitting it with --limited falls back to the global window
        #[arg(long)]
        window: Option<String>,

        /// Constrain to the daily window instead of running around the clock
        #[arg(long)]
        limited: bool,

        /// Opaque media reference from an intake surface (repeatable)
        #[arg(long = "media-ref")]
        media_refs: Vec<String>,
    },

    /// Queue a filler post for idle periods
    Pending {
        /// Message text (or album caption when media refs are given)
        text: Option<String>,

        /// Destination chat id (defaults to crier.primary_chat)
        #[arg(long)]
        chat: Option<i64>,

        /// Opaque media reference from an intake surface (repeatable)
        #[arg(long = "media-ref")]
        media_refs: Vec<String>,
    },

    /// Telegram session management
    Tg {
        #[command(subcommand)]
        command: TgCommands,
    },
}

#[derive(Subcommand)]
pub enum TgCommands {
    /// Interactive MTProto login wizard
    Login,
    /// Show Telegram session status
    Status,
}
