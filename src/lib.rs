//! Lockstep host - authoritative command-synchronization server
//!
//! The host collects commands from every participant, releases them in
//! fixed-length cycles and freezes the shared clock whenever a participant
//! falls behind. Participants that stay behind for too long are removed.

pub mod app;
pub mod config;
pub mod http;
pub mod lockstep;
pub mod util;
pub mod ws;
