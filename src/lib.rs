//! A user-space sound server: mixes playback streams from clients into
//! output devices and fans captured audio out to recording clients, over a
//! framed binary protocol on local or TCP sockets.
//!
//! The [`protocol`] module is a standalone implementation of the wire
//! protocol, suitable for writing clients and tools as well; [`core`] is
//! the audio engine, [`mainloop`] the event multiplexer, and [`server`]
//! the native protocol server that ties them together.

#![warn(
    anonymous_parameters,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

use std::path::PathBuf;

pub mod core;
pub mod mainloop;
pub mod protocol;
pub mod server;

/// Attempts to determine the server socket path from the runtime
/// environment, checking the following locations in order:
///   - $SONORD_SERVER
///   - $XDG_RUNTIME_DIR/sonord/native
///
/// Returns `None` if neither is set.
pub fn socket_path_from_env() -> Option<PathBuf> {
    std::env::var("SONORD_SERVER")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("XDG_RUNTIME_DIR")
                .ok()
                .map(|s| PathBuf::from(s).join("sonord/native"))
        })
}

/// Attempts to find the authentication cookie path from the environment,
/// checking the following locations in order:
///   - $SONORD_COOKIE
///   - $HOME/.config/sonord/cookie
pub fn cookie_path_from_env() -> Option<PathBuf> {
    std::env::var("SONORD_COOKIE")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".config/sonord/cookie"))
        })
}
