//! Funnel page builder and its AI copilot.
//!
//! A funnel is a JSON document of steps → frames → stacks → blocks →
//! elements (`models`). `builder` edits the tree, `copilot` turns prompts
//! into blocks, funnel drafts or settings patches, and `api` exposes both
//! over HTTP.

pub mod api;
pub mod builder;
pub mod copilot;
pub mod models;
