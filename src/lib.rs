//! lanspeed -- LAN speed-test server and client.
//!
//! A server broadcasts Offer messages over UDP so clients on the same
//! network can find it without configuration. Each client round opens a
//! configurable number of parallel TCP and UDP transfers against the
//! discovered server, measures achieved throughput (and packet loss on the
//! UDP path), and prints one aggregate report per round.

pub mod client;
pub mod config;
pub mod discovery;
pub mod protocol;
pub mod server;
pub mod stats;

pub use client::{RoundParams, SpeedTestClient};
pub use config::Config;
pub use server::SpeedTestServer;
