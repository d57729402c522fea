//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the hub's two
//! tables, keeping query details and secret encryption out of the services.

pub mod connection;
pub mod oauth_state;

pub use connection::{ConnectionRepository, NewConnectionTokens};
pub use oauth_state::{NewOAuthState, OAuthStateRepository, StateConsumption};
