mod booking;
mod escrow;
mod gateway;
pub mod ledger;
mod notify;

pub use booking::*;
pub use escrow::*;
pub use gateway::*;
pub use notify::*;
