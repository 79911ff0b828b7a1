pub mod audit;
pub mod auth;
pub mod crypto;
pub mod email_otp;
pub mod lockout;
pub mod passkey;
pub mod rate_limit;
pub mod settings;
pub mod two_factor;
