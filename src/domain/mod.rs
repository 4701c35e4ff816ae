//! Domain layer: identifiers, entities, events and the snapshot bus.
//!
//! Plain data types with no I/O. Storage lives behind the ports in
//! [`crate::persistence`] and [`crate::coordination`].

pub mod ad_view;
pub mod ads_event;
pub mod advertisement;
pub mod amount;
pub mod event_bus;
pub mod ids;
pub mod payout;
pub mod reservation;
pub mod room;
pub mod session;
pub mod snapshot;

pub use ad_view::AdView;
pub use ads_event::AdsEvent;
pub use advertisement::{AdStatus, Advertisement, PricingTable};
pub use event_bus::EventBus;
pub use ids::{AdId, ReservationId, RoomId, SessionId, UserId};
pub use payout::{Payout, PayoutClaim, PayoutReceipt, PayoutRecipient, PayoutStatus};
pub use reservation::{Reservation, ReservationStatus, ReservationSummary};
pub use room::Room;
pub use session::{IdleReason, SessionState, StartRejection, StopReason};
pub use snapshot::RoomSnapshot;
