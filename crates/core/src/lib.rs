//! `tenantgate-core` — tenancy primitives shared by the data-access engine.
//!
//! This crate contains **no storage concerns**: identifiers, the tenant
//! context boundary, and the errors they can raise.

pub mod error;
pub mod id;
pub mod tenant;

pub use error::{CoreError, CoreResult};
pub use id::TenantId;
pub use tenant::{StaticTenant, TaskTenant, TenantContext};
