//! vigil-core — Identity enrollment and face verification.
//!
//! Holds the enrolled-identity registry, the cosine matcher, the durable
//! event log and the alert hook, and wires them into the enroll/verify
//! flows. Face detection and embedding come from an [`EmbeddingProvider`].

pub mod alert;
pub mod config;
pub mod events;
pub mod matcher;
pub mod provider;
pub mod registry;
pub mod session;
pub mod types;

pub use alert::{Notifier, NoopNotifier, SoundNotifier};
pub use config::Config;
pub use events::{EventRecord, EventSink, EventType, JsonEventLog, RecorderHandle};
pub use matcher::{CosineMatcher, Matcher, DEFAULT_THRESHOLD};
pub use provider::{EmbeddingProvider, ProviderError};
pub use registry::{Registry, RegistryStore};
pub use session::{Session, SessionError, VerificationReport};
pub use types::{BoundingBox, DetectedFace, Embedding, IdentityTemplate, Label, MatchVerdict};
