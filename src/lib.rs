//! # esdlscript: request/response transformation scripts
//!
//! An embeddable interpreter for a small declarative language written as
//! tagged XML elements. Scripts are bound to a service, a method and a
//! transaction phase; at run time they read the request through a scoped
//! read cursor, write the response through a scoped write cursor, and can
//! narrow which log agents see the transaction.
//!
//! ## Loading
//!
//! [`Environment::load_script`] and [`Environment::load_binding`] drive the
//! statement [`Factory`](statement::Factory), which builds one statement tree
//! per phase element. Problems found while loading are recorded in the
//! [`Outcomes`](outcome::Outcomes) ledger of the [`LoadContext`] instead of
//! being raised, so one bad element does not discard a whole script.
//!
//! ## Processing
//!
//! A [`ProcessContext`] owns the state of one transaction:
//! - read and write cursors ([`cursor`])
//! - the frame-scoped variable stack ([`variables`])
//! - trace levels ([`trace`])
//! - the outcome ledger ([`outcome`])
//! - the log agent filter ([`log_agent`])
//!
//! [`Environment::process_phase`] runs the tree bound to the context's
//! request and phase. Loaded trees are immutable and shared, so one
//! environment serves any number of threads.
//!
//! The process state can be written to an XML snippet and restored later
//! through [`persist::Persistent`].

pub mod config;
pub mod context;
pub mod cursor;
pub mod environment;
pub mod error;
pub mod log_agent;
pub mod outcome;
pub mod persist;
pub mod statement;
pub mod trace;
pub mod variables;
pub mod xml;
pub mod xpath;

// Re-exports
pub use context::{LoadContext, ProcessContext, RequestContext, ServiceRequest};
pub use environment::{Environment, PhaseResult, Script};
pub use error::*;
pub use statement::Phase;
