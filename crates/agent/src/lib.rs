//! VM agent binary support: process settings and the health/metrics API

pub mod api;
pub mod settings;
