//! Mutating admission webhook that injects the device host path into pods
//! requesting the resource.

pub mod mutator;
pub mod server;

use core::error::Error;

use derive_more::Display;

pub use mutator::ConflictError;
pub use mutator::HostPathMutator;
pub use server::WebhookServer;

#[derive(Debug, Display)]
pub enum WebhookError {
    #[display("Failed to load TLS material from {path}")]
    Tls { path: String },
    #[display("Webhook server on {listen} failed")]
    Server { listen: String },
}

impl Error for WebhookError {}
