mod resolve;
mod validate;

pub use resolve::run_resolve;
pub use validate::{run_validate, ValidateArgs};
