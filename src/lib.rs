//! Identity service core.
//!
//! Implements the authorization resolution engine (cached permission
//! resolution with precise invalidation) and the credential lifecycle
//! (access/refresh token issuance and rotation, plus a two-factor
//! step-up challenge). Transport, email delivery and the persistence
//! engine sit behind trait seams in [`db`] and [`services`].
//!
//! All domain timestamps are UTC.

pub mod config;
pub mod db;
pub mod models;
pub mod observability;
pub mod services;
pub mod utils;
