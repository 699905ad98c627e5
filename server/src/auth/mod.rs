pub mod jwt;

pub use jwt::{validate_access_token, Claims};
