// Model types are part of the public API - some methods/structs may not be used internally yet
#![allow(dead_code)]

mod booking;
mod notification;
mod payment;
mod service;
mod user;

pub use booking::*;
pub use notification::*;
pub use payment::*;
pub use service::*;
pub use user::*;
