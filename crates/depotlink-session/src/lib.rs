//! Depotlink Session
//!
//! Client-side session engine for a version-control server:
//! - One exclusively checked-out connection per server (`slot`)
//! - Login probing and classification of authentication failures (`auth`)
//! - Classify / retry / re-authenticate / escalate for every operation (`runner`)
//! - Serialized hand-off of critical errors and batched warnings (`alerts`)
//! - Online/offline state with bounded foreground and unbounded background waits (`gate`)
//! - `SessionManager` tying it together per server identity

pub mod alerts;
pub mod auth;
pub mod credentials;
pub mod gate;
pub mod logging;
pub mod manager;
pub mod runner;
pub mod slot;

pub use alerts::{
    handler_fn, AlertCause, AlertDetails, ConnectionProblem, ConsumerExecutor, CriticalError,
    CriticalErrorHandler, CriticalErrorQueue, CriticalErrorQueueBuilder, HandlerExecutor,
    LogWarningSink, ProblemHandlerFactory, ReportOnlyHandler, ResolutionContext,
    StandardProblemHandlers, Warning, WarningLevel, WarningSink,
};
pub use auth::AuthenticationClassifier;
pub use credentials::{MemoryCredentialProvider, PasswordPrompt};
pub use gate::{ConnectionGate, GatePermit};
pub use logging::init_tracing;
pub use manager::{ServerSession, SessionDeps, SessionManager};
pub use runner::{classify, OperationRunner, RetryEpisode};
pub use slot::{ConnectionHandle, ConnectionSlot, Lease, OwnerToken, SlotError, SlotStats};
