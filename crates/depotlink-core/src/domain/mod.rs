//! Domain entities

mod auth_status;
mod credential;
mod event;
mod identity;

pub use auth_status::{AuthState, AuthenticationStatus};
pub use credential::OneUseCredential;
pub use event::{ProblemKind, SessionEvent};
pub use identity::ServerIdentity;
