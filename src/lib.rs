//! Federated agent orchestration control plane.
//!
//! Coordinates agents across clusters: registration and capability
//! lookup ([`registry`]), health monitoring ([`health`]), per-agent
//! circuit breaking ([`breaker`]), load-balanced selection
//! ([`balancer`]), dependency-aware task planning ([`resolver`],
//! [`dag`]), parallel execution with retries ([`engine`]), and
//! cross-cluster agent migration ([`migrator`], [`cluster`]).
//!
//! Every component is transport-agnostic: the traits in [`ports`] are
//! the seams a host application implements to plug in its own RPC,
//! HTTP, or in-process transport. [`adapters::http`] ships a reference
//! `reqwest`-backed implementation behind the `http-adapters` feature.
//! Lifecycle events for every component are published on a shared
//! [`events::EventBus`].

pub mod adapters;
pub mod balancer;
pub mod breaker;
pub mod cluster;
pub mod dag;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod metadata;
pub mod migrator;
pub mod ports;
pub mod registry;
pub mod resolver;
pub mod types;

pub use balancer::{BalancerConfig, LoadBalancer, Strategy};
pub use breaker::{CircuitBreaker, CircuitBreakerRegistry};
pub use cluster::ClusterRegistry;
pub use dag::Dag;
pub use engine::ExecutionEngine;
pub use error::{FederationError, Result};
pub use events::{Event, EventBus};
pub use health::{HealthChecker, HealthCheckerConfig};
pub use metadata::MetadataValue;
pub use migrator::{AgentMigrator, MigrationOptions, MigratorConfig};
pub use registry::AgentRegistry;
pub use resolver::DependencyResolver;

/// Crate version, exposed for diagnostics and `/version`-style endpoints.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
