pub mod bus;
pub mod envelope;
pub mod kv;
pub mod ratelimit;

pub use bus::{Bus, SubscribeError, Subscription};
pub use envelope::{topics, Envelope, Payload};
pub use kv::Kv;
