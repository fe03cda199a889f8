//! NutriCycle edge gateway
//!
//! Sits between camera devices, the remote image classifier and live viewers:
//! a bounded classification queue, a persistent device stream registry, a
//! low-latency MJPEG proxy and on-demand HLS transcoding.

pub mod app_state;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
