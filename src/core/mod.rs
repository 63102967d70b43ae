pub mod client;
pub mod error;
pub mod naming;
pub mod pool;
pub mod publisher;
pub mod subscriber;
