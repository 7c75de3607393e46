pub mod admission;
pub mod cache;
pub mod config;
pub mod config_validator;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod key_pool;
pub mod metrics;
pub mod middleware;
pub mod providers;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod redis;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod token_bucket;
pub mod validation;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult};
pub use request::{Dispatched, ResultSource, Translation, TranslationRequest};
pub use server::create_app;
