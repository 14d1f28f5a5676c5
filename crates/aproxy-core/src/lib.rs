//! Request pipeline: path classification, lazy body parsing, the
//! retry/reroute engine, paid-gateway fallback, and background refresh.

pub mod body;
pub mod classify;
pub mod engine;
pub mod refresh;
pub mod state;
pub mod upstream;

pub use body::ParsedBody;
pub use classify::{RouteClass, classify_path, model_from_url, provider_route};
pub use engine::{Engine, LocalOutcome};
pub use state::AppState;
pub use upstream::UpstreamProxy;
