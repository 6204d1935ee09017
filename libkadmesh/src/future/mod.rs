//! Futures: one-shot completion handles for asynchronous operations.

mod base;
mod response;
mod routing;
mod shutdown;

pub use base::{BaseFuture, FutureState, Listener, Outcome};
pub use response::{FailureReason, Request, RequestId, Response, ResponseFuture};
pub use routing::{RoutingFuture, RoutingResult};
pub use shutdown::ShutdownFuture;
