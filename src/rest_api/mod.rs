//! HTTP endpoints for health checks and Prometheus scraping

mod handlers;
mod server;

pub use server::{router, run_server};
