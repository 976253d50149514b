//! Journey engine core.
//!
//! Students walk a playbook: worlds of nodes connected by a DAG. Each node
//! carries form data, upload slots and a small state machine; advisors
//! review attachments and finished nodes unlock their successors.
//!
//! ## Layout
//! Every operation goes through [`JourneyService`]:
//! playbook snapshot -> one store transaction -> notifications after commit
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use journey_core::{Cancellation, EngineConfig, JourneyService, MemoryStore, Principal, Role};
//! use uuid::Uuid;
//!
//! # async fn demo() -> journey_core::Result<()> {
//! let service = JourneyService::new(Arc::new(MemoryStore::new()), &EngineConfig::default());
//! let tenant = Uuid::new_v4();
//! let admin = Principal::new(tenant, Uuid::new_v4(), Role::Admin);
//! let raw = br#"{"version":"1","worlds":[{"id":"W1","nodes":[{"id":"intro"}]}]}"#;
//! service.ingest_playbook(&admin, raw, &Cancellation::none()).await?;
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Identity and vocabulary
pub mod principal;
pub mod state;
pub mod transitions;

// Playbook catalog and form validators
pub mod playbook;
pub mod validators;

// Persistence ports and backends
pub mod store;

// Engine internals
pub mod activation;
pub mod authz;
pub mod instances;
pub mod notifications;
pub mod object_store;

// Ambient concerns
pub mod cancel;
pub mod config;

// Public surface
pub mod dto;
pub mod service;

pub use cancel::{CancelHandle, Cancellation};
pub use config::{DatabaseConfig, EngineConfig, ObjectStoreConfig};
pub use error::{ErrorCode, JourneyError, Result};
pub use playbook::{IngestStatus, Ingested, Playbook, PlaybookCatalog};
pub use principal::{AuthClaims, Principal, Role};
pub use service::JourneyService;
pub use state::{AttachmentStatus, EventType, NodeState, ReviewDecision};
pub use store::{JourneyStore, JourneyTx, MemoryStore};
pub use transitions::TransitionRegistry;

#[cfg(feature = "postgres")]
pub use store::postgres::PgStore;
