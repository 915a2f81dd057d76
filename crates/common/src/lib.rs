pub mod config;
pub mod envelope;
pub mod error;
pub mod jwt;
pub mod model;
pub mod pkce;

pub use config::*;
pub use envelope::*;
pub use error::*;
pub use jwt::{Claims, SigningKeySet, TokenError};
pub use model::*;
pub use pkce::*;
