//! Subscription fan-out for per-device inbound traffic
//!
//! Each `(device, class)` watch owns a bounded channel between the
//! transport's I/O task (producer) and the caller (consumer). Delivery never
//! blocks: when the buffer is full the message is dropped and the whole
//! subscription is torn down and unsubscribed. A later watch starts over
//! with a fresh subscription.

mod manager;
mod stream;

pub use manager::FanoutManager;
pub use stream::DeviceStream;
