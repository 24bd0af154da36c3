pub mod chain;
pub mod classify;
mod error;
pub mod exec;
mod reconcile;
pub mod route;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::Error;
pub use exec::{CommandRunner, DEFAULT_COMMAND_TIMEOUT, SudoRunner};
pub use reconcile::{Apply, MARK, Pass, Reconciler};
pub use route::DEFAULT_RT_TABLES;

pub type Result<T, E = Error> = std::result::Result<T, E>;
