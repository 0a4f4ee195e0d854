//! Notification interceptors: observers with a gated re-entry path.

mod intercept;
mod scope;
mod set;

#[cfg(feature = "logging")]
mod log;

pub use intercept::Intercept;
pub use scope::InterceptorScope;

#[cfg(feature = "logging")]
pub use log::LogWriter;

pub(crate) use set::InterceptorSet;
