//! Sales pipeline back-end: stages, appointments and the closer board.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  api.rs  (route handlers)                        │
//! │  (board) │ <─────── │    │                                             │
//! └──────────┘ WebSocket│    │ StageWorkflow::move_card() / resolve_*()   │
//!                       │    v                                             │
//!                       │  workflow.rs  (transitions, dialogs, undo)       │
//!                       │    │                │                │           │
//!                       │    v                v                v           │
//!                       │  store.rs      calendar.rs       ws.rs           │
//!                       │  (CrmStore)    (CalendarClient)  (BoardNotifier) │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `models`      | `Appointment`, `PipelineStage`, `StageKind`, tasks      |
//! | `aggregation` | Board columns and per-closer buckets with totals        |
//!
//! Every successful write is followed by a change-feed message; clients
//! refetch rather than patch local state.

pub mod aggregation;
pub mod api;
pub mod calendar;
pub mod models;
pub mod store;
pub mod workflow;
pub mod ws;
