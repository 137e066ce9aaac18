pub mod forecast;
pub mod overrides;
pub mod readings;
pub mod state;

pub use forecast::*;
pub use overrides::*;
pub use readings::*;
pub use state::*;
