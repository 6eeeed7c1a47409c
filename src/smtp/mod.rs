//! # SMTP protocol module
//!
//! The client side used by the implicit-TLS delivery path, plus a tiny
//! relay built on a state machine with Enums and matching so tests can watch
//! the dialogue from the server's end.

mod session;
#[cfg(test)]
pub(crate) mod testing;

pub use session::{DataStream, Reply, SmtpError, SmtpSession};
pub(crate) use session::timed;
