//! # Depotlink Core Library
//!
//! Domain types and collaborator contracts for the depotlink session manager.
//!
//! ## Modules
//!
//! - `domain` - Server identity, authentication status, one-use credentials, events
//! - `error` - Raw protocol failures, the error taxonomy and terminal session errors
//! - `config` - Session tuning knobs and server message patterns
//! - `collaborators` - Traits for the protocol client and credential provider
//! - `event_bus` - Broadcast distribution of session events

pub mod collaborators;
pub mod config;
pub mod domain;
pub mod error;
pub mod event_bus;

// Re-export commonly used types
pub use collaborators::*;
pub use config::{LoggingConfig, MessagePatterns, SessionConfig};
pub use domain::*;
pub use error::{
    AuthFailureReason, CredentialError, ErrorKind, ProtocolError, SessionError, SessionResult,
};

pub use event_bus::{EventBus, EventReceiver, EventSender};
