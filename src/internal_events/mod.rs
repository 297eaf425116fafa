//! Event-driven instrumentation. Every notable occurrence is a struct that
//! knows how to log itself and bump its own metrics, so call sites stay free
//! of logging/metrics plumbing.

mod broker;
mod controller;
mod gate;
pub mod prelude;
mod router;
mod store;

pub use broker::*;
pub use controller::*;
pub use gate::*;
pub use router::*;
pub use store::*;

pub trait InternalEvent {
    fn emit(self);
}

#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::internal_events::InternalEvent::emit($event)
    };
}
