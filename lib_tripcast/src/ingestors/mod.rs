//! Broker transports that feed raw payloads into the engine.

pub mod redis_pubsub;
