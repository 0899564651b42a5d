mod aggregate;
mod query;
mod usage;
mod validators;

pub use aggregate::*;
pub use query::*;
pub use usage::*;
