//! facegate-service: the registration gate and its operator surface.

pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod notify;
pub mod person;
pub mod settings;

pub use config::{ConfigError, GateConfig};
pub use engine::{spawn_engine, EmbeddingExtractor, EngineError, EngineHandle};
pub use error::{InternalError, RegisterError};
pub use gate::RegistrationGate;
pub use notify::{NotifyError, NullNotifier, RegistrationNotifier};
pub use person::{Gender, NullSink, PersonProfile, PersonSink, ProfileError, SinkError};
pub use settings::{MatchPolicy, PolicyError, PolicyUpdate, SettingsRegistry};
