//! Exchange gateway: an abstract exchange API plus a concurrent,
//! token-bucket-limited batch executor.

pub mod api;
pub mod gateway;
pub mod limiter;
pub mod types;

#[cfg(any(test, feature = "test-mocks"))]
pub use api::MockExchangeApi;
pub use api::{ExchangeApi, RestExchange};
pub use gateway::{client_order_id, Gateway};
pub use limiter::RateLimiter;
pub use types::*;
