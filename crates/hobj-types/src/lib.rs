#[allow(non_snake_case)]
pub mod status_code;

pub mod status;

#[macro_use]
pub mod strong_type;

pub mod ids;

// Re-export commonly used items at the crate root.
pub use ids::*;
pub use status::{Result, Status, make_error, make_error_msg};
pub use status_code::*;
