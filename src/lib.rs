//! # mail-relay-api
//!
//! Small HTTP service that turns a `{to, subject, body}` JSON request into
//! an email sent through an upstream SMTP relay. Port 465 relays are spoken
//! to over implicit TLS with a hand-driven SMTP session; any other port goes
//! through `lettre`, which upgrades with STARTTLS when it can.

pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod smtp;
pub mod tracing;
pub mod web;
