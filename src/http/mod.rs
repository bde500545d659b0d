//! HTTP transport for the limiters.

mod context;
mod middleware;
mod server;

pub use context::HttpContext;
pub use middleware::{enforce, rejection_response};
pub use server::{AdmissionServer, CheckRequest, CheckResponse};
