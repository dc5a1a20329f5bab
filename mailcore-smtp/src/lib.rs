//! A line-oriented SMTP client: connect, negotiate extensions, run a mail
//! transaction, and read the server's responses back.
//!
//! This crate only speaks the client half of the protocol. It has no
//! listener, no session state machine, and no notion of an inbound
//! connection — those concerns belong to the acceptor, which is out of
//! scope here. What's here is what the outbound delivery courier needs to
//! actually talk to a remote MX: `SmtpClient` for driving a single
//! connection command-by-command, and `SmtpClientBuilder` for scripting a
//! whole conversation (handy for integration tests against a server).

pub mod client;
