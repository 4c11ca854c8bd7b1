// ABOUTME: Codegate gateway library: runs untrusted Python behind admission, validation and sandboxing
// ABOUTME: Re-exports the pipeline entry point and the types callers need to build requests and read results

pub mod admission;
pub mod clock;
pub mod cost;
pub mod error;
pub mod executors;
pub mod gateway;
pub mod monitor;
pub mod normalizer;
pub mod request;
pub mod resilience;
pub mod router;
pub mod settings;
pub mod types;
pub mod validator;

pub use admission::{CounterStore, MemoryCounterStore, SqliteCounterStore};
pub use error::GatewayError;
pub use gateway::{EngineHealth, Gateway, GatewayBuilder, HealthReport};
pub use settings::{ConfigError, GatewayConfig};
pub use types::{
    CodeInput, Confidence, Engine, ErrorDetail, ErrorKind, ExecutionRequest, ExecutionResult,
    LimitType, SourceFile, Tier,
};
pub use validator::{ValidationVerdict, Validator};
