//! Registry-v2 protocol client, image reference parsing, and the
//! challenge-response auth helper the client drives on `401`.

mod auth_challenge;
mod client;
pub mod reference;

pub use client::{RegistryClient, DEFAULT_CONCURRENCY};
