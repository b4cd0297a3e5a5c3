//! Real-time plan progress: stream events and the pub/sub bus that carries them

mod bus;
mod types;

pub use bus::{EventBus, EventStream};
pub use types::{EventType, StreamEvent};
