//! HTTP surface for the provisioner.

pub mod auth;
pub mod error;
mod handlers;
pub mod server;
pub mod types;

pub use server::{RunningGateway, router, start_server};
