//! graphsync: keeps a lazily loaded commit graph in sync with a rendering
//! surface that may be hidden, not yet ready, or unreachable.
//!
//! The [`controller::SessionController`] is the entry point. It answers
//! surface requests, reacts to host events and delivers notifications through
//! the [`dispatch::Outbox`]. Collaborators it calls out to are declared in
//! [`provider`]; [`git`] and [`storage`] implement the ones the binary ships.

pub mod channel;
pub mod config;
pub mod controller;
pub mod debounce;
pub mod dispatch;
pub mod event;
pub mod git;
pub mod protocol;
pub mod provider;
pub mod search;
pub mod selection;
pub mod storage;
pub mod theme;
pub mod window;
