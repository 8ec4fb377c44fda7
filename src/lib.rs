//! gator: a command-line RSS aggregator.
//!
//! Users register feeds and follow them; `gator agg` polls one feed per tick,
//! least recently fetched first, and stores each item once per feed.

pub mod commands;
pub mod config;
pub mod feed;
pub mod scheduler;
pub mod storage;
pub mod util;
