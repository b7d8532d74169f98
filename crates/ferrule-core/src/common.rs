pub mod call;
pub mod error;
pub mod exclusion;
pub mod id;
pub mod outcome;
pub mod state;

pub use error::{Error, Result};
