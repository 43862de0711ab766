//! Shared compensation routine.
//!
//! Every abort path runs the same sequence: saga failure, escalation, user
//! "stop", and the reaper all call `rollback_collected`. The two modes share
//! the sequence; `Update` preserves rows confirmed by an earlier successful
//! provisioning through the remote-id guards, and restores the vehicle
//! association that was active before the attempt.

use uuid::Uuid;

use crate::catalog::FlowId;
use crate::error::Result;
use crate::store::Database;

/// Whether the aborted attempt was creating a brand-new account or updating
/// an existing one. Decides how deep the cleanup reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackMode {
    Creation,
    Update,
}

/// Pick the mode for an abort: a registration attempt is a `Creation` unless
/// the collected phone already belongs to a provisioned driver; every other
/// flow touches an existing account.
pub(crate) async fn infer_mode(
    store: &dyn Database,
    user: &str,
    flow: FlowId,
) -> Result<RollbackMode> {
    if flow != FlowId::Registration {
        return Ok(RollbackMode::Update);
    }
    let Some(phone_row) = store.find_ledger_row(user, FlowId::Registration, 2).await? else {
        return Ok(RollbackMode::Creation);
    };
    match store.find_driver_by_phone(&phone_row.message).await? {
        Some(driver) if driver.remote_profile_id.is_some() => Ok(RollbackMode::Update),
        _ => Ok(RollbackMode::Creation),
    }
}

/// Remove everything collected during the current attempt.
///
/// Must run before the ledger is cleared: the collected phone numbers are
/// read off the ledger rows. Associations are deleted before their car so no
/// association ever points at a missing car row.
pub(crate) async fn rollback_collected(
    store: &dyn Database,
    user: &str,
    flow: FlowId,
    mode: RollbackMode,
) -> Result<()> {
    // Documents not yet re-owned by a driver always belong to the attempt.
    store.delete_documents_for_owner(user).await?;

    let phones = collected_phones(store, user, flow).await?;
    let Some(primary) = phones.first().cloned() else {
        tracing::debug!(user, %flow, "Nothing collected yet, rollback is a no-op");
        return Ok(());
    };
    for phone in &phones {
        store.delete_otps_for_phone(phone).await?;
    }

    let Some(driver) = store.find_driver_by_phone(&primary).await? else {
        tracing::debug!(user, %flow, "No driver record collected");
        return Ok(());
    };

    match mode {
        // A brand-new driver has no pre-attempt vehicle; every association is
        // attempt debris ("back" plus a resubmission can leave several), and
        // all of them must go before the driver row can.
        RollbackMode::Creation => {
            delete_attempt_vehicles(store, driver.id).await?;
        }
        // Peel unconfirmed cars off the top until the vehicle confirmed by an
        // earlier provisioning is active again.
        RollbackMode::Update => {
            while let Some(active) = store.active_association(driver.id).await? {
                let Some(car) = store.find_car(active.car_id).await? else {
                    break;
                };
                if car.remote_vehicle_id.is_some() {
                    break;
                }
                store.delete_association(active.id).await?;
                store.delete_car(car.id).await?;
                match store.last_ended_association(driver.id).await? {
                    Some(previous) => store.reopen_association(previous.id).await?,
                    None => break,
                }
            }
        }
    }

    // A driver record without a remote profile only ever comes from the
    // current attempt; a provisioned one is confirmed data and survives.
    if mode == RollbackMode::Creation && driver.remote_profile_id.is_none() {
        store.delete_licenses_for_driver(driver.id).await?;
        store.delete_driver(driver.id).await?;
    }

    tracing::info!(user, %flow, ?mode, "Rolled back collected data");
    Ok(())
}

/// Delete every association of a driver along with its car, keeping cars a
/// past provisioning confirmed. Runs before the driver row itself is deleted
/// so no association is left pointing at a missing driver.
pub(crate) async fn delete_attempt_vehicles(
    store: &dyn Database,
    driver_id: Uuid,
) -> Result<()> {
    for assoc in store.associations_for_driver(driver_id).await? {
        store.delete_association(assoc.id).await?;
        if let Some(car) = store.find_car(assoc.car_id).await? {
            if car.remote_vehicle_id.is_none() {
                store.delete_car(car.id).await?;
            }
        }
    }
    Ok(())
}

/// The phone numbers collected so far in this flow, primary first.
///
/// A ledger row's `message` is the validated answer to the step before it,
/// so the phone entered at level 1 sits on the level-2 row. The phone-change
/// flow collects two numbers (current on row 2, new on row 3).
async fn collected_phones(
    store: &dyn Database,
    user: &str,
    flow: FlowId,
) -> Result<Vec<String>> {
    let mut phones = Vec::new();
    match flow {
        FlowId::Root => {}
        FlowId::Registration | FlowId::VehicleChange => {
            if let Some(row) = store.find_ledger_row(user, flow, 2).await? {
                phones.push(row.message);
            }
        }
        FlowId::PhoneChange => {
            for level in [2, 3] {
                if let Some(row) = store.find_ledger_row(user, FlowId::PhoneChange, level).await? {
                    phones.push(row.message);
                }
            }
        }
    }
    Ok(phones)
}
