pub mod correction;
pub mod open_meteo;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::Forecast;

pub use correction::{correct, current_conditions};
pub use open_meteo::OpenMeteoClient;

/// Source of hourly, multi-day weather forecasts.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch(&self) -> Result<Forecast>;
}
