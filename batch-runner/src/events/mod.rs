//! Event bus connecting the pipeline engine and transfer queue to observers.

mod bus;
mod types;

pub use bus::{EventBus, EventStream};
pub use types::{
    Event, EventType, LogEvent, LogLevel, OVERALL_STAGE, ProgressEvent, StateChangeEvent,
    TransferEvent,
};
