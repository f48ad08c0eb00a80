//! Handler module - typed service methods and their erased dispatch table.
//!
//! Provides:
//! - [`ServiceBuilder`] / [`ServiceDefinition`] - maps method indices to methods
//! - [`Param`] / [`ServiceArgs`] - argument binding, including async-typed parameters
//! - [`Returned`] / [`Outcome`] - byte-level results the invoker writes back
//! - [`ResponseContext`] - writes responses for one call
//!
//! # Example
//!
//! ```
//! use remotewire::codec::MsgPackSerializer;
//! use remotewire::handler::ServiceBuilder;
//! use remotewire::promise::Promise;
//! use remotewire::ServiceError;
//!
//! struct Math;
//!
//! fn gcd(a: i64, b: i64) -> i64 {
//!     if b == 0 { a.abs() } else { gcd(b, a % b) }
//! }
//!
//! let definition = ServiceBuilder::new(Math, MsgPackSerializer)
//!     .interface("example.Math")
//!     .async_method("coprime", |_: &Math, (a, b, strict): (i64, i64, Promise<bool>)| async move {
//!         let strict = strict.await.map_err(ServiceError::from)?;
//!         let coprime = gcd(a, b) == 1;
//!         if strict && !coprime {
//!             return Err(ServiceError::with_kind(
//!                 "illegal_argument",
//!                 format!("{} and {} are not coprime", a, b),
//!             ));
//!         }
//!         Ok(coprime)
//!     })
//!     .build();
//!
//! assert_eq!(definition.len(), 1);
//! ```

mod args;
mod context;
mod registry;
mod returns;

pub use args::{ArgBinder, ArgCompletion, ArgResolver, AsyncArg, Param, ParamShape, ServiceArgs};
pub use context::ResponseContext;
pub use registry::{Invocation, MethodEntry, ServiceBuilder, ServiceDefinition};
pub use returns::{ByteStream, Completion, Outcome, ResponseBody, ReturnShape, Returned};
