// Core runtime abstractions for Weft
// Process model and descriptor merger, CWL package handling, reference
// fetcher, vault cryptography, built-in processes, provenance, settings.

pub mod auth;
pub mod builtin;
pub mod config;
pub mod error;
pub mod fetch;
pub mod model;
pub mod package;
pub mod prov;
pub mod vault;

pub use auth::AuthContext;
pub use config::{Configuration, RequestProfile, Settings};
pub use error::{Error, Result};
pub use fetch::{Fetched, Fetcher, VaultAccess};
pub use model::{
    Format, IoDescriptor, IoType, LiteralType, Occurrence, ProcessModel,
};
pub use package::{ExecutionUnit, Package, StepRequirement};
pub use vault::VaultCrypto;
