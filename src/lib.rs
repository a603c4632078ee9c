//! Reports Wi-Fi client presence from an OpenWrt access point to Home Assistant.

pub mod config;
pub mod engine;
pub mod hass;
pub mod manager;
pub mod messages;
pub mod queue;
pub mod scanner;
pub mod scheduler;
pub mod store;
pub mod worker;
