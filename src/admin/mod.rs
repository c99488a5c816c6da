//! Data layer behind the admin console's users, categorizations and
//! configuration screens.

pub mod client;
pub mod keys;
pub mod routing;
pub mod service;
pub mod types;

pub use client::AdminClient;
pub use service::AdminService;
