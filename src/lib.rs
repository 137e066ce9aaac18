//! Predictive climate control for a shade-equipped greenhouse.
//!
//! Every poll interval the controller reads its sensors, bias-corrects a public
//! weather forecast against the local station, simulates the indoor temperature
//! under the current and a shades-open actuator state, and commands shades and
//! exhaust fans ahead of heat buildup.

pub mod config;
pub mod controller;
pub mod domain;
pub mod forecast;
pub mod hardware;
pub mod repo;
pub mod resilience;
pub mod simulation;
pub mod telemetry;
