pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use bus::{BusEvent, EventBus};
pub use config::AppConfig;
pub use error::{Result, TesseraError};
pub use event::{CompactedEvent, Emitter, Event, EventKind, EventRecord, Scope};
pub use types::*;
