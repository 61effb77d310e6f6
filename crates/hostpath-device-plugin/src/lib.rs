pub mod config;
pub mod deviceplugin;
pub mod webhook;
