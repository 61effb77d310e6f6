//! Command layer - Entry points for the device plugin and the webhook

pub mod device_plugin;
pub mod webhook;

pub use device_plugin::run_device_plugin;
pub use webhook::run_webhook;
