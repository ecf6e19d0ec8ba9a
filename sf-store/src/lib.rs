pub mod bmc;
pub mod ctx;
pub mod db_model_manager;
pub mod error;

pub use ctx::*;
pub use db_model_manager::*;
pub use error::*;
