//! # conceptlib-core
//!
//! Core types, rules and algorithms for the clinical concept library.
//!
//! This crate holds everything that does not need a database: the entity
//! and revision model, the permission decision, publication transitions,
//! as-of child selection, the concept reference graph, export row assembly
//! and the traits `conceptlib-db` implements.
//!
//! ## Logging
//!
//! Events carry `subsystem`, `component` and `op` fields, plus
//! `entity_type`, `entity_id`, `revision_id` and `actor_id` where they apply.
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Requires operator attention |
//! | WARN  | Recoverable, a fallback was applied (e.g. notification dropped) |
//! | INFO  | Completed mutations and workflow transitions |
//! | DEBUG | Permission decisions, graph loads, config choices |
//! | TRACE | Per-item iteration (child revisions, codes) |

pub mod aggregate;
pub mod as_of;
pub mod config;
pub mod defaults;
pub mod entity_code;
pub mod error;
pub mod filter;
pub mod graph;
pub mod models;
pub mod notify;
pub mod permissions;
pub mod publication;
pub mod traits;

// Re-export commonly used types at crate root
pub use aggregate::{assemble_rows, ConceptCodes, ExportRow, Lineage, PhenotypeLineage};
pub use config::{ConcurrencyPolicy, CoreConfig};
pub use entity_code::{entity_code, parse_entity_code};
pub use error::{Error, Result, ValidationErrors};
pub use filter::{DateRange, EntityFilter, Predicate, ValidatedFilter};
pub use graph::{CodeSet, ConceptArena, ConceptNode, ReferenceIndex};
pub use models::*;
pub use notify::{ChannelNotifier, Notification, Notifier, TracingNotifier};
pub use permissions::{AccessDecision, AccessFacts, BrandScope, Denial, Grant};
pub use publication::PublishAction;
pub use traits::*;
