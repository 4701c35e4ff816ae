//! Data Transfer Objects for REST request/response serialization.
//!
//! Token amounts inside payouts are serialized as JSON strings to prevent
//! precision loss on u128 values.

pub mod payout_dto;
pub mod room_dto;
pub mod session_dto;

pub use payout_dto::*;
pub use room_dto::*;
pub use session_dto::*;
