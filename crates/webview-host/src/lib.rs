//! Mirrors headless browser tabs to remote displays.
//!
//! Each device id owns one tab. Captured stills are deduplicated,
//! rate-limited, diffed tile by tile against the previous frame, encoded per
//! rectangle and fanned out in size-bounded chunks to every display attached
//! to that id. Displays send touch, keepalive, navigation and frame
//! statistics back over the same socket.

pub mod broadcast;
pub mod browser;
pub mod cdp;
pub mod coalesce;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod device;
pub mod error;
pub mod input;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod stats;
pub mod tiles;

#[cfg(test)]
pub(crate) mod testing;
