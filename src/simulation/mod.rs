//! # Greenhouse Thermal Simulation
//!
//! Predicts indoor air temperature from the current state, a (bias-corrected)
//! hourly weather forecast and a hypothetical actuator state.
//!
//! ## Model
//!
//! Two lumped nodes exchange heat:
//!
//! - **Air**: small heat capacity, receives most of the transmitted solar gain and
//!   loses heat through the glazing and through the exhaust fans.
//! - **Thermal mass**: concrete perimeter, floor and gravel beds. Absorbs a share of
//!   the solar gain and couples to the air, damping swings by several hours.
//!
//! East and west roof shades are modelled independently, since each blocks its own
//! roof face only.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use greenhouse_controller::simulation::{simulate, ThermalParameters};
//!
//! let trajectory = simulate(
//!     &state,
//!     &ThermalParameters::default(),
//!     &corrected.forecast,
//!     state.actuators(),
//!     chrono::Duration::hours(6),
//!     chrono::Duration::seconds(60),
//!     chrono::Utc::now(),
//! )?;
//! let peak = trajectory.predicted_max(trajectory.steps_in(120));
//! ```

pub mod thermal;

pub use thermal::{
    c_to_f, f_to_c, resample_forecast, simulate, GreenhouseThermalModel, ModelSnapshot,
    SimulationError, StepInputs, ThermalNodes, ThermalParameters, Trajectory, TrajectoryPoint,
};
