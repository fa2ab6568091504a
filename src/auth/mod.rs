//! Operator authentication
//!
//! Handles:
//! - Signed operator session tokens
//! - Admin capability checks on backup routes

mod middleware;
pub mod session;

pub use middleware::CurrentOperator;
pub use session::{OperatorSession, create_session_token, verify_session_token};
