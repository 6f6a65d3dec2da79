//! Per-guild music playback for a Discord voice bot.
//!
//! The engine lives in [`audio`]: a [`audio::manager::PlayerManager`] hands out
//! one [`audio::player::Player`] per guild, which resolves songs through
//! [`sources`], streams them through ffmpeg and tees finished downloads into
//! [`cache`].

pub mod api;
pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod storage;
pub mod ui;
