pub mod billing;
pub mod error;
pub mod models;
pub mod status;

pub use billing::*;
pub use error::*;
pub use models::*;
pub use status::*;
