pub(crate) mod cache;
mod dispatch;
pub(crate) mod estimate;
pub(crate) mod run;
pub(crate) mod status;

pub use dispatch::dispatch;
