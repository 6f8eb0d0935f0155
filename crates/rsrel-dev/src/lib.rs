//! rsrel-dev: developer sandbox for relationship schemas
//!
//! A sandbox compiles a schema, loads test relationships into an isolated
//! store and answers checks, expansions and found-subject queries against
//! it. Problems a developer can fix come back as [`DeveloperError`]s;
//! everything else is an infrastructural [`DevError`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      rsrel-dev                       │
//! ├─────────────────────────────────────────────────────┤
//! │  context/       - sandbox construction and disposal  │
//! │  loader/        - schema and relationship loading    │
//! │  classify/      - dispatch error classification      │
//! │  assertions/    - assertTrue/False/Caveated          │
//! │  validation/    - expected-subject validation        │
//! │  adapters/      - storage behind the domain ports    │
//! │  config/        - layered sandbox configuration      │
//! │  observability/ - structured logging                 │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod adapters;
pub mod assertions;
pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod loader;
pub mod observability;
pub mod request;
pub mod validation;

pub use assertions::{run_assertions, Assertion, AssertionKind};
pub use classify::{classify, rewrite_dispatch_error, ErrorReporter, EvaluationScope};
pub use config::DevConfig;
pub use context::DevContext;
pub use error::{DevContextError, DevError, DevResult, DeveloperError, ErrorKind, ErrorSource};
pub use request::DevRequest;
pub use validation::{generate_validation, validate_expected};
