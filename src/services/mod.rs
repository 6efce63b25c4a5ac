// FanCast Services
// Business logic layer

mod config_store;
mod destination_urls;
mod error;
mod events;
mod logger;
mod module_registry;
mod preflight;
mod relay_supervisor;
mod telemetry_bus;

pub use config_store::*;
pub use destination_urls::*;
pub use error::*;
pub use events::*;
pub use logger::*;
pub use module_registry::*;
pub use preflight::*;
pub use relay_supervisor::*;
pub use telemetry_bus::*;
