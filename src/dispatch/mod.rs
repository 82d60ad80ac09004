//! Callback scheduling core: the worker dispatcher, the promise type that
//! settles through it, and dispose-once handles for engine-registered
//! objects.

mod handle;
mod promise;
mod queue;
mod worker;

pub use handle::{Dispose, Handle, WeakHandle};
pub use promise::{Promise, Rejecter, Resolver};
pub use worker::Dispatcher;
