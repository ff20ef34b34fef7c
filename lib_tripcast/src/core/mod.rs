//! The engine proper: session state, fan-out and the timers that drive them.

pub mod broadcast_hub;
pub mod connectivity;
pub mod events;
pub mod pipeline;
pub mod reaper;
pub mod registry;
pub mod sample;
pub mod settings;
pub mod throttle;
