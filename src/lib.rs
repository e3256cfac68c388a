//! Streaming CORS relay for IPTV players.
//!
//! A client calls `<proxy_path>?url=<encoded upstream URL>`. The relay fetches
//! the target with a fixed sequence of header identities, stopping at the
//! first one the origin does not reject with `403`, then:
//!
//! - rewrites HLS and classic M3U playlists so every referenced URL comes back
//!   through the relay ([`playlist`]),
//! - streams everything else to the client without buffering, preserving
//!   status and range headers ([`relay`]).

pub mod classify;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod metrics;
pub mod playlist;
pub mod relay;
pub mod server;
pub mod upstream;
