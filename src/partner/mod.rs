//! Partner platform integration: remote API client and provisioning saga.

pub mod client;
pub mod saga;

pub use client::{HttpPartnerClient, PartnerClient, ProfileRequest, VehicleRequest};
pub use saga::{ProvisionMode, ProvisioningSaga, SagaOutcome};
