//! Connection Gateway: the connection hub plus the generation driver that
//! turns Generation Service output into registry updates and fan-out.

pub mod driver;
pub mod hub;

pub use self::hub::{ConnectionId, Hub};
