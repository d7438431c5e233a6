//! Authentication for Numera API routes

pub mod cron;
pub mod jwt;
pub mod middleware;

pub use cron::{require_cron_token, CronToken};
pub use jwt::{Claims, JwtManager};
pub use middleware::{require_auth, AuthError, AuthUser};
