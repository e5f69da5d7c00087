//! # Call State Machine
//!
//! Tracks every in-flight call from origination to its business outcome.
//!
//! - [`state`]: call states and the pure `(state, event) -> (state', actions)` table
//! - [`record`]: the per-call record, tombstones and the opt-out suppression list
//! - [`engine`]: the single loop that owns all calls and carries out actions
//!
//! ## Outcomes
//!
//! | Terminal state       | Reached by                                   |
//! |----------------------|----------------------------------------------|
//! | `Busy`               | busy hangup before answer                    |
//! | `NoAnswer`           | no-answer hangup or ring timeout             |
//! | `OriginationFailed`  | PBX rejected the call or it never set up     |
//! | `Hungup`             | any other hangup, or assumed lost            |
//! | `Timeout`            | IVR timeout or an unrecognised digit         |
//! | `DonationRequested`  | digit `1`                                    |
//! | `OptOutRequested`    | digit `9`; the number is suppressed          |

pub mod engine;
pub mod record;
pub mod state;

pub use engine::{CallEngine, EngineCommand, EngineHandle, EngineStats};
pub use record::{Call, SuppressionList, Tombstones};
pub use state::{transition, CallAction, CallEvent, CallState, Transition};
