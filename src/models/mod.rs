pub mod audit;
pub mod passkey;
pub mod security;
pub mod user;

pub use audit::*;
pub use passkey::*;
pub use security::*;
pub use user::*;
