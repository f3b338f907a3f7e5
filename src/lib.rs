//! Core of a runtime function interceptor.
//!
//! This crate is the host-independent core of a Frida-Gum-style API
//! interceptor: an [`interceptor::Interceptor`] that tracks which addresses
//! are instrumented, a per-thread [`invocation`] engine that dispatches
//! `on_enter`/`on_leave` listener callbacks and replacement calls, and a
//! [`transaction`] batcher that turns a burst of attach/detach/replace
//! calls into a single executable-memory update.
//!
//! What talks to the actual CPU, OS, and code generator is out of scope:
//! the [`backend::Backend`], [`backend::CodeAllocator`], and [`backend::Os`]
//! traits are the seam a concrete host implements. A process wires one in
//! once via [`Interceptor::set_host`] and calls [`Interceptor::obtain`]
//! from then on; the `test-support` feature (or running under `cargo test`)
//! also exposes in-memory doubles of all three under
//! [`backend::testing`] for exercising this core's own logic.

pub mod address;
pub mod backend;
pub mod constants;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod invocation;
pub mod listener;
pub mod thread_context;
pub mod transaction;

pub use address::{CodeAddress, RawAddress};
pub use error::{InterceptorError, Result};
pub use interceptor::Interceptor;
pub use invocation::{CpuContext, InvocationContext, NextHop};
pub use listener::{InvocationListener, ListenerId, PointCut};
