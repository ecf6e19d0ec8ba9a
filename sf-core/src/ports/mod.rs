pub mod clock;
pub mod market_data;
pub mod router;
pub mod ship_ops;

pub use clock::*;
pub use market_data::*;
pub use router::*;
pub use ship_ops::*;
