//! Provisioning saga — ordered remote calls with idempotency pre-checks.
//!
//! The saga itself never deletes local state: on any failed step it reports
//! `Aborted` and the caller runs the shared compensation routine, so every
//! abort path (saga failure, escalation, stop, reaper) rolls back the same
//! way. Local rows only ever receive a remote id after the full sequence has
//! succeeded.

use std::sync::Arc;

use crate::catalog::FlowId;
use crate::error::Result;
use crate::partner::client::{PartnerClient, ProfileRequest, VehicleRequest};
use crate::store::Database;
use crate::store::model::{HistoryReason, HistoryStatus};

/// Whether this provisioning run creates a brand-new account or updates an
/// existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionMode {
    Create,
    Update,
}

/// Result of a saga run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    Completed,
    /// The name of the step that failed, for logging and audit.
    Aborted { step: &'static str },
}

/// Orchestrates partner-platform provisioning.
pub struct ProvisioningSaga {
    store: Arc<dyn Database>,
    partner: Arc<dyn PartnerClient>,
}

impl ProvisioningSaga {
    pub fn new(store: Arc<dyn Database>, partner: Arc<dyn PartnerClient>) -> Self {
        Self { store, partner }
    }

    /// Run the provisioning sequence for the driver registered under `phone`:
    /// create-vehicle, create-profile (CREATE only), bind, then persist
    /// remote ids, relink documents, and mark the attempt succeeded.
    ///
    /// Each remote step is guarded by a local pre-check so a retried saga
    /// reuses already-provisioned remote ids instead of double-creating.
    pub async fn provision(
        &self,
        user: &str,
        phone: &str,
        mode: ProvisionMode,
    ) -> Result<SagaOutcome> {
        let flow = match mode {
            ProvisionMode::Create => FlowId::Registration,
            ProvisionMode::Update => FlowId::VehicleChange,
        };

        let Some(driver) = self.store.find_driver_by_phone(phone).await? else {
            tracing::error!(user, phone, "Saga started without a local driver record");
            return Ok(SagaOutcome::Aborted { step: "load_driver" });
        };
        let Some(assoc) = self.store.active_association(driver.id).await? else {
            tracing::error!(user, "Saga started without an active vehicle association");
            return Ok(SagaOutcome::Aborted { step: "load_vehicle" });
        };
        let Some(car) = self.store.find_car(assoc.car_id).await? else {
            tracing::error!(user, "Active association points at a missing car");
            return Ok(SagaOutcome::Aborted { step: "load_vehicle" });
        };

        // Step 1: create-vehicle, skipped when the car is already provisioned.
        let vehicle_id = match car.remote_vehicle_id.clone() {
            Some(id) => id,
            None => {
                let req = VehicleRequest {
                    plate: car.plate.clone(),
                    make: car.make.clone(),
                    color: car.color.clone(),
                };
                match self.partner.create_vehicle(&req).await {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::warn!(user, error = %e, "create_vehicle failed, aborting saga");
                        return Ok(SagaOutcome::Aborted {
                            step: "create_vehicle",
                        });
                    }
                }
            }
        };

        // Step 2: create-profile (CREATE mode only), skipped when already known.
        let profile_id = match (&mode, driver.remote_profile_id.clone()) {
            (_, Some(id)) => id,
            (ProvisionMode::Create, None) => {
                let license_number = self
                    .store
                    .find_license_for_driver(driver.id)
                    .await?
                    .map(|l| l.license_number)
                    .unwrap_or_default();
                let req = ProfileRequest {
                    first_name: driver.first_name.clone(),
                    last_name: driver.last_name.clone(),
                    phone: driver.phone.clone(),
                    license_number,
                };
                match self.partner.create_profile(&req).await {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::warn!(user, error = %e, "create_profile failed, aborting saga");
                        return Ok(SagaOutcome::Aborted {
                            step: "create_profile",
                        });
                    }
                }
            }
            (ProvisionMode::Update, None) => {
                tracing::error!(user, "Update saga but the driver has no remote profile id");
                return Ok(SagaOutcome::Aborted { step: "load_profile" });
            }
        };

        // Step 3: bind driver to vehicle.
        if let Err(e) = self.partner.bind_vehicle(&profile_id, &vehicle_id).await {
            tracing::warn!(user, error = %e, "bind_vehicle failed, aborting saga");
            return Ok(SagaOutcome::Aborted {
                step: "bind_vehicle",
            });
        }

        // Step 4: full success — only now do remote ids touch local rows.
        self.store
            .update_car_remote_id(car.id, &vehicle_id)
            .await?;
        self.store
            .update_driver_remote_id(driver.id, &profile_id)
            .await?;
        self.store
            .assign_documents_to_driver(user, driver.id)
            .await?;
        self.store
            .close_history(
                user,
                flow,
                HistoryStatus::Succeeded,
                HistoryReason::NormalFinish,
            )
            .await?;

        tracing::info!(user, vehicle_id, profile_id, "Provisioning completed");
        Ok(SagaOutcome::Completed)
    }

    /// Phone-change saga: fetch the remote profile (200), push the new phone
    /// (204), then update the local record and mark the attempt succeeded.
    pub async fn change_phone(
        &self,
        user: &str,
        old_phone: &str,
        new_phone: &str,
    ) -> Result<SagaOutcome> {
        let Some(driver) = self.store.find_driver_by_phone(old_phone).await? else {
            tracing::error!(user, "Phone-change saga without a local driver record");
            return Ok(SagaOutcome::Aborted { step: "load_driver" });
        };
        let Some(profile_id) = driver.remote_profile_id.clone() else {
            tracing::error!(user, "Phone-change saga but the driver has no remote profile id");
            return Ok(SagaOutcome::Aborted { step: "load_profile" });
        };

        if let Err(e) = self.partner.get_profile(&profile_id).await {
            tracing::warn!(user, error = %e, "get_profile failed, aborting phone change");
            return Ok(SagaOutcome::Aborted { step: "get_profile" });
        }
        if let Err(e) = self.partner.update_phone(&profile_id, new_phone).await {
            tracing::warn!(user, error = %e, "update_phone failed, aborting phone change");
            return Ok(SagaOutcome::Aborted { step: "update_phone" });
        }

        self.store.update_driver_phone(driver.id, new_phone).await?;
        self.store
            .close_history(
                user,
                FlowId::PhoneChange,
                HistoryStatus::Succeeded,
                HistoryReason::NormalFinish,
            )
            .await?;

        tracing::info!(user, "Phone number updated");
        Ok(SagaOutcome::Completed)
    }
}
