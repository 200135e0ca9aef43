//! Transaction scheduling: contexts, bound sessions and queues

mod context;
pub(crate) mod queue;
mod request;
mod session;
mod types;

pub use context::{CompletionListener, TransactionContext};
pub use queue::{TxCounter, TxQueue};
pub use request::Deferred;
pub use session::Session;
pub use types::{Scope, TerminalEvent, TerminalKind, TransactionMode, TxState};
