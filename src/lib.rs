//! Quire: a full-page response cache for dynamically rendered sites.
//!
//! The [`cache`] module holds the caching core (eligibility, keys, the
//! on-disk page store, the output transform and invalidation). [`infra`]
//! wires it to the filesystem, the upstream proxy and the HTTP listeners.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
