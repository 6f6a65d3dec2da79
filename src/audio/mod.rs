//! # Audio Module
//!
//! Per-guild playback engine.
//!
//! ## Architecture
//!
//! ### [`manager`] - Player Registry
//! - Lazily creates one [`player::Player`] per guild and keeps it around
//!
//! ### [`player`] - Playback State Machine
//! - `Idle` / `Playing` / `Paused` transitions driven by commands and voice events
//! - Skips songs that fail to resolve or transcode
//! - Loop modes, volume, idle disconnect and auto-announce
//!
//! ### [`queue`] - Queue Management
//! - Songs plus a cursor: history before it, queue ahead after it
//!
//! ### [`clock`] - Position Clock
//! - 1 Hz elapsed-seconds counter, frozen while paused
//!
//! ### [`pipeline`] - Transcoding Pipeline
//! - ffmpeg subprocess relayed to the voice driver, teed into the content cache
//!
//! ### [`transport`] - Voice Transport
//! - Traits the player talks to, implemented on top of songbird
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use guild_jukebox::audio::{manager::PlayerManager, player::PlayerServices};
//! use guild_jukebox::sources::QueuedSong;
//! use serenity::all::{ChannelId, GuildId};
//!
//! # async fn example(services: PlayerServices, song: QueuedSong) -> anyhow::Result<()> {
//! let manager = PlayerManager::new(services);
//! let player = manager.get(GuildId::new(123456789));
//!
//! player.connect(ChannelId::new(42)).await?;
//! player.add(song, false);
//! player.play().await?;
//!
//! player.pause().await?;
//! player.play().await?;
//! player.forward(1).await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod manager;
pub mod pipeline;
pub mod player;
pub mod queue;
pub mod transport;
