//! Step handlers — the `(flow, level)` transition function.
//!
//! Each handler validates the inbound payload against its step's contract,
//! runs the step's side effect (OTP issue/verify, document ingestion and
//! extraction, saga invocation), and returns an [`Outcome`] for the
//! dispatcher to apply. Handlers never write ledger rows themselves.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use crate::catalog::{ErrorKind, FlowId};
use crate::channels::{ImageBody, Payload};
use crate::engine::dispatch::Outcome;
use crate::engine::rollback;
use crate::engine::{
    Engine, PHONE_CHANGE_DONE, PROVISIONING_FAILED, REGISTRATION_DONE, VEHICLE_CHANGE_DONE,
};
use crate::error::{DatabaseError, EngineError, Result};
use crate::extract::{self, ExtractOutcome};
use crate::otp::OtpCheck;
use crate::partner::{ProvisionMode, SagaOutcome};
use crate::store::model::{
    Car, CarAssociation, DocumentFile, DocumentKind, DocumentSide, Driver, DriverLicense,
    LedgerRow,
};

static DIGITS_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("static regex"));

/// Normalize a locally-formatted phone number: exactly 10 digits starting
/// with 0, stored with the country code replacing the leading zero.
pub(crate) fn normalize_phone(
    raw: &str,
    country_code: &str,
) -> std::result::Result<String, ErrorKind> {
    let raw = raw.trim();
    if !DIGITS_ONLY.is_match(raw) {
        return Err(ErrorKind::IncorrectChoice);
    }
    if raw.len() == 10 && raw.starts_with('0') {
        Ok(format!("{country_code}{}", &raw[1..]))
    } else {
        Err(ErrorKind::EqualLength)
    }
}

enum Choice {
    Confirm,
    Cancel,
}

fn text_of<'a>(payload: &'a Payload<'_>) -> Option<&'a str> {
    match payload {
        Payload::Text(text) => Some(text.trim()),
        Payload::Image(_) => None,
    }
}

fn choice_of(payload: &Payload<'_>) -> Option<Choice> {
    match text_of(payload)? {
        "1" => Some(Choice::Confirm),
        "2" => Some(Choice::Cancel),
        _ => None,
    }
}

fn vars1(name: &'static str, value: String) -> HashMap<&'static str, String> {
    HashMap::from([(name, value)])
}

impl Engine {
    /// The dispatch table: `(flow, level)` of the step awaiting an answer.
    pub(crate) async fn run_handler(
        &self,
        user: &str,
        row: &LedgerRow,
        payload: &Payload<'_>,
    ) -> Result<Outcome> {
        match (row.flow, row.level) {
            (FlowId::Root, 0) => self.select_flow(payload),
            (FlowId::Registration, 1) => self.registration_phone(user, payload).await,
            (FlowId::Registration, 2) => {
                self.verify_otp(user, row, payload, HashMap::new()).await
            }
            (FlowId::Registration, 3) => self.license_front(user, payload).await,
            (FlowId::Registration, 4) => self.license_back(user, payload).await,
            (FlowId::Registration, 5) => {
                self.car_registration(user, FlowId::Registration, payload).await
            }
            (FlowId::Registration, 6) => self.confirm_registration(user, payload).await,
            (FlowId::VehicleChange, 1) => self.vehicle_change_phone(user, payload).await,
            (FlowId::VehicleChange, 2) => {
                self.verify_otp(user, row, payload, HashMap::new()).await
            }
            (FlowId::VehicleChange, 3) => {
                self.car_registration(user, FlowId::VehicleChange, payload).await
            }
            (FlowId::VehicleChange, 4) => self.confirm_vehicle_change(user, payload).await,
            (FlowId::PhoneChange, 1) => self.phone_change_current(payload).await,
            (FlowId::PhoneChange, 2) => self.phone_change_new(user, payload).await,
            (FlowId::PhoneChange, 3) => {
                let vars = vars1("phone", row.message.clone());
                self.verify_otp(user, row, payload, vars).await
            }
            (FlowId::PhoneChange, 4) => self.confirm_phone_change(user, payload).await,
            (flow, level) => Err(EngineError::UnknownStep {
                flow: flow.to_string(),
                level,
            }
            .into()),
        }
    }

    /// Root level 0: "1" / "2" / "3" selects a flow.
    fn select_flow(&self, payload: &Payload<'_>) -> Result<Outcome> {
        let Some(text) = text_of(payload) else {
            return Ok(Outcome::Invalid(ErrorKind::IncorrectChoice));
        };
        let flow = match text {
            "1" => FlowId::Registration,
            "2" => FlowId::VehicleChange,
            "3" => FlowId::PhoneChange,
            _ => return Ok(Outcome::Invalid(ErrorKind::IncorrectChoice)),
        };
        Ok(Outcome::Next {
            flow,
            level: 1,
            stored: text.to_string(),
            vars: HashMap::new(),
        })
    }

    /// Registration level 1: a phone number that must NOT already have an
    /// account. Issues the OTP on success.
    async fn registration_phone(&self, user: &str, payload: &Payload<'_>) -> Result<Outcome> {
        let Some(text) = text_of(payload) else {
            return Ok(Outcome::Invalid(ErrorKind::IncorrectChoice));
        };
        let phone = match normalize_phone(text, &self.config.country_code) {
            Ok(phone) => phone,
            Err(kind) => return Ok(Outcome::Invalid(kind)),
        };
        if self.store.find_driver_by_phone(&phone).await?.is_some() {
            return Ok(Outcome::Invalid(ErrorKind::IsExist));
        }
        self.otp.issue(user, &phone).await?;
        Ok(Outcome::Next {
            flow: FlowId::Registration,
            level: 2,
            vars: vars1("phone", phone.clone()),
            stored: phone,
        })
    }

    /// Vehicle-change level 1: a phone number that MUST have an account.
    async fn vehicle_change_phone(&self, user: &str, payload: &Payload<'_>) -> Result<Outcome> {
        let Some(text) = text_of(payload) else {
            return Ok(Outcome::Invalid(ErrorKind::IncorrectChoice));
        };
        let phone = match normalize_phone(text, &self.config.country_code) {
            Ok(phone) => phone,
            Err(kind) => return Ok(Outcome::Invalid(kind)),
        };
        if self.store.find_driver_by_phone(&phone).await?.is_none() {
            return Ok(Outcome::Invalid(ErrorKind::IsNotExist));
        }
        self.otp.issue(user, &phone).await?;
        Ok(Outcome::Next {
            flow: FlowId::VehicleChange,
            level: 2,
            vars: vars1("phone", phone.clone()),
            stored: phone,
        })
    }

    /// Phone-change level 1: the currently registered number. No OTP yet;
    /// verification happens against the NEW number.
    async fn phone_change_current(&self, payload: &Payload<'_>) -> Result<Outcome> {
        let Some(text) = text_of(payload) else {
            return Ok(Outcome::Invalid(ErrorKind::IncorrectChoice));
        };
        let phone = match normalize_phone(text, &self.config.country_code) {
            Ok(phone) => phone,
            Err(kind) => return Ok(Outcome::Invalid(kind)),
        };
        if self.store.find_driver_by_phone(&phone).await?.is_none() {
            return Ok(Outcome::Invalid(ErrorKind::IsNotExist));
        }
        Ok(Outcome::Next {
            flow: FlowId::PhoneChange,
            level: 2,
            stored: phone,
            vars: HashMap::new(),
        })
    }

    /// Phone-change level 2: the new number, which must be free. The OTP is
    /// keyed by the new number and delivered to the user's chat.
    async fn phone_change_new(&self, user: &str, payload: &Payload<'_>) -> Result<Outcome> {
        let Some(text) = text_of(payload) else {
            return Ok(Outcome::Invalid(ErrorKind::IncorrectChoice));
        };
        let phone = match normalize_phone(text, &self.config.country_code) {
            Ok(phone) => phone,
            Err(kind) => return Ok(Outcome::Invalid(kind)),
        };
        if self.store.find_driver_by_phone(&phone).await?.is_some() {
            return Ok(Outcome::Invalid(ErrorKind::IsExist));
        }
        self.otp.issue(user, &phone).await?;
        Ok(Outcome::Next {
            flow: FlowId::PhoneChange,
            level: 3,
            vars: vars1("phone", phone.clone()),
            stored: phone,
        })
    }

    /// Any OTP step. The phone the code was issued for is this row's own
    /// `message`. An expired code is re-issued before the retry message goes
    /// out, so the user can answer the fresh one.
    async fn verify_otp(
        &self,
        user: &str,
        row: &LedgerRow,
        payload: &Payload<'_>,
        next_vars: HashMap<&'static str, String>,
    ) -> Result<Outcome> {
        let Some(code) = text_of(payload) else {
            return Ok(Outcome::Invalid(ErrorKind::IncorrectCode));
        };
        match self.otp.verify(&row.message, code).await? {
            OtpCheck::Accepted => Ok(Outcome::Next {
                flow: row.flow,
                level: row.level + 1,
                stored: code.to_string(),
                vars: next_vars,
            }),
            OtpCheck::WrongCode => Ok(Outcome::Invalid(ErrorKind::IncorrectCode)),
            OtpCheck::Expired => {
                self.otp.issue(user, &row.message).await?;
                Ok(Outcome::Invalid(ErrorKind::IsExpired))
            }
        }
    }

    /// Registration level 3: license-front photo. OCR + extraction create the
    /// driver and license records. A resubmission after "back" replaces the
    /// records built on the first pass.
    async fn license_front(&self, user: &str, payload: &Payload<'_>) -> Result<Outcome> {
        let image = match self.accept_image(payload) {
            Ok(image) => image,
            Err(kind) => return Ok(Outcome::Invalid(kind)),
        };
        let lines = self.recognizer.recognize(&image.link).await?;
        let fields = match extract::extract(DocumentKind::DriverLicense, &lines) {
            ExtractOutcome::License(fields) => fields,
            _ => return Ok(Outcome::Resubmit),
        };

        let phone = self.stored_input(user, FlowId::Registration, 2).await?;
        if let Some(existing) = self.store.find_driver_by_phone(&phone).await? {
            if existing.remote_profile_id.is_none() {
                // The user came "back" past a carte grise submission: the
                // stale attempt may hold vehicle associations too.
                rollback::delete_attempt_vehicles(self.store.as_ref(), existing.id).await?;
                self.store.delete_licenses_for_driver(existing.id).await?;
                self.store.delete_driver(existing.id).await?;
            }
        }

        let driver = Driver {
            id: Uuid::new_v4(),
            phone,
            first_name: fields.first_name,
            last_name: fields.last_name,
            birth_date: Some(fields.birth_date),
            remote_profile_id: None,
            created_at: Utc::now(),
        };
        self.store.insert_driver(&driver).await?;
        self.store
            .insert_license(&DriverLicense {
                id: Uuid::new_v4(),
                driver_id: driver.id,
                license_number: fields.license_number,
                issue_date: Some(fields.issue_date),
                expiry_date: Some(fields.expiry_date),
            })
            .await?;
        self.ingest_document(user, image, DocumentKind::DriverLicense, DocumentSide::Front)
            .await?;

        Ok(Outcome::Next {
            flow: FlowId::Registration,
            level: 4,
            stored: image.id.clone(),
            vars: HashMap::new(),
        })
    }

    /// Registration level 4: license-back photo. Stored as-is, no extraction.
    async fn license_back(&self, user: &str, payload: &Payload<'_>) -> Result<Outcome> {
        let image = match self.accept_image(payload) {
            Ok(image) => image,
            Err(kind) => return Ok(Outcome::Invalid(kind)),
        };
        self.ingest_document(user, image, DocumentKind::DriverLicense, DocumentSide::Back)
            .await?;
        Ok(Outcome::Next {
            flow: FlowId::Registration,
            level: 5,
            stored: image.id.clone(),
            vars: HashMap::new(),
        })
    }

    /// Carte-grise photo, shared by registration (level 5) and vehicle change
    /// (level 3). Creates the car and its association; the previous active
    /// association (if any) is ended, to be restored only by a rollback.
    async fn car_registration(
        &self,
        user: &str,
        flow: FlowId,
        payload: &Payload<'_>,
    ) -> Result<Outcome> {
        let image = match self.accept_image(payload) {
            Ok(image) => image,
            Err(kind) => return Ok(Outcome::Invalid(kind)),
        };
        let lines = self.recognizer.recognize(&image.link).await?;
        let fields = match extract::extract(DocumentKind::CarRegistration, &lines) {
            ExtractOutcome::Registration(fields) => fields,
            _ => return Ok(Outcome::Resubmit),
        };

        let phone = self.stored_input(user, flow, 2).await?;
        let Some(driver) = self.store.find_driver_by_phone(&phone).await? else {
            return Err(DatabaseError::NotFound {
                entity: "driver".to_string(),
                key: phone,
            }
            .into());
        };

        let now = Utc::now();
        if let Some(active) = self.store.active_association(driver.id).await? {
            self.store.end_association(active.id, now).await?;
        }
        let car = Car {
            id: Uuid::new_v4(),
            plate: fields.plate.clone(),
            make: fields.make.clone(),
            color: fields.color.clone(),
            first_registration: Some(fields.first_registration),
            remote_vehicle_id: None,
            created_at: now,
        };
        self.store.insert_car(&car).await?;
        self.store
            .insert_association(&CarAssociation {
                id: Uuid::new_v4(),
                driver_id: driver.id,
                car_id: car.id,
                start_date: now,
                end_date: None,
            })
            .await?;
        self.ingest_document(user, image, DocumentKind::CarRegistration, DocumentSide::Front)
            .await?;

        let mut vars = HashMap::from([
            ("make", fields.make),
            ("color", fields.color),
            ("plate", fields.plate),
        ]);
        let next_level = match flow {
            FlowId::Registration => {
                vars.insert(
                    "name",
                    format!("{} {}", driver.first_name, driver.last_name),
                );
                let license = self
                    .store
                    .find_license_for_driver(driver.id)
                    .await?
                    .map(|l| l.license_number)
                    .unwrap_or_default();
                vars.insert("license", license);
                6
            }
            _ => 4,
        };

        Ok(Outcome::Next {
            flow,
            level: next_level,
            stored: image.id.clone(),
            vars,
        })
    }

    /// Registration level 6: confirmation, then the provisioning saga.
    async fn confirm_registration(&self, user: &str, payload: &Payload<'_>) -> Result<Outcome> {
        match choice_of(payload) {
            Some(Choice::Confirm) => {
                let phone = self.stored_input(user, FlowId::Registration, 2).await?;
                match self
                    .saga
                    .provision(user, &phone, ProvisionMode::Create)
                    .await?
                {
                    SagaOutcome::Completed => Ok(Outcome::Complete {
                        message: REGISTRATION_DONE,
                    }),
                    SagaOutcome::Aborted { step } => {
                        tracing::warn!(user, step, "Registration provisioning aborted");
                        Ok(Outcome::Failed {
                            message: PROVISIONING_FAILED,
                        })
                    }
                }
            }
            Some(Choice::Cancel) => Ok(Outcome::Cancelled),
            None => Ok(Outcome::Invalid(ErrorKind::IncorrectChoice)),
        }
    }

    /// Vehicle-change level 4: confirmation, then the saga in UPDATE mode.
    async fn confirm_vehicle_change(&self, user: &str, payload: &Payload<'_>) -> Result<Outcome> {
        match choice_of(payload) {
            Some(Choice::Confirm) => {
                let phone = self.stored_input(user, FlowId::VehicleChange, 2).await?;
                match self
                    .saga
                    .provision(user, &phone, ProvisionMode::Update)
                    .await?
                {
                    SagaOutcome::Completed => Ok(Outcome::Complete {
                        message: VEHICLE_CHANGE_DONE,
                    }),
                    SagaOutcome::Aborted { step } => {
                        tracing::warn!(user, step, "Vehicle-change provisioning aborted");
                        Ok(Outcome::Failed {
                            message: PROVISIONING_FAILED,
                        })
                    }
                }
            }
            Some(Choice::Cancel) => Ok(Outcome::Cancelled),
            None => Ok(Outcome::Invalid(ErrorKind::IncorrectChoice)),
        }
    }

    /// Phone-change level 4: confirmation, then the remote phone update.
    async fn confirm_phone_change(&self, user: &str, payload: &Payload<'_>) -> Result<Outcome> {
        match choice_of(payload) {
            Some(Choice::Confirm) => {
                let old_phone = self.stored_input(user, FlowId::PhoneChange, 2).await?;
                let new_phone = self.stored_input(user, FlowId::PhoneChange, 3).await?;
                match self.saga.change_phone(user, &old_phone, &new_phone).await? {
                    SagaOutcome::Completed => Ok(Outcome::Complete {
                        message: PHONE_CHANGE_DONE,
                    }),
                    SagaOutcome::Aborted { step } => {
                        tracing::warn!(user, step, "Phone change aborted");
                        Ok(Outcome::Failed {
                            message: PROVISIONING_FAILED,
                        })
                    }
                }
            }
            Some(Choice::Cancel) => Ok(Outcome::Cancelled),
            None => Ok(Outcome::Invalid(ErrorKind::IncorrectChoice)),
        }
    }

    fn accept_image<'a>(
        &self,
        payload: &'a Payload<'_>,
    ) -> std::result::Result<&'a ImageBody, ErrorKind> {
        let Payload::Image(image) = payload else {
            return Err(ErrorKind::IncorrectChoice);
        };
        if image.file_size > self.config.max_image_bytes {
            return Err(ErrorKind::MaxSize);
        }
        Ok(image)
    }

    async fn ingest_document(
        &self,
        user: &str,
        image: &ImageBody,
        kind: DocumentKind,
        side: DocumentSide,
    ) -> Result<()> {
        self.store
            .insert_document(&DocumentFile {
                id: Uuid::new_v4(),
                owner_address: user.to_string(),
                driver_id: None,
                media_id: image.id.clone(),
                media_url: image.link.clone(),
                kind,
                side,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Re-derive the placeholder values for a step's prompt from stored
    /// state. Used when a prompt is re-sent outside its normal transition
    /// ("back"). Best-effort: a missing value leaves its token in place.
    pub(crate) async fn prompt_vars(
        &self,
        user: &str,
        flow: FlowId,
        level: u8,
    ) -> Result<HashMap<&'static str, String>> {
        let mut vars = HashMap::new();
        match (flow, level) {
            (FlowId::Registration, 2) | (FlowId::VehicleChange, 2) => {
                if let Ok(phone) = self.stored_input(user, flow, 2).await {
                    vars.insert("phone", phone);
                }
            }
            (FlowId::PhoneChange, 3) | (FlowId::PhoneChange, 4) => {
                if let Ok(phone) = self.stored_input(user, FlowId::PhoneChange, 3).await {
                    vars.insert("phone", phone);
                }
            }
            (FlowId::Registration, 6) | (FlowId::VehicleChange, 4) => {
                let Ok(phone) = self.stored_input(user, flow, 2).await else {
                    return Ok(vars);
                };
                let Some(driver) = self.store.find_driver_by_phone(&phone).await? else {
                    return Ok(vars);
                };
                if flow == FlowId::Registration {
                    vars.insert(
                        "name",
                        format!("{} {}", driver.first_name, driver.last_name),
                    );
                    if let Some(license) = self.store.find_license_for_driver(driver.id).await? {
                        vars.insert("license", license.license_number);
                    }
                }
                if let Some(active) = self.store.active_association(driver.id).await? {
                    if let Some(car) = self.store.find_car(active.car_id).await? {
                        vars.insert("make", car.make);
                        vars.insert("color", car.color);
                        vars.insert("plate", car.plate);
                    }
                }
            }
            _ => {}
        }
        Ok(vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_digit_local_number_gets_country_code() {
        assert_eq!(
            normalize_phone("0612345678", "+212"),
            Ok("+212612345678".to_string())
        );
        assert_eq!(
            normalize_phone("  0612345678  ", "+212"),
            Ok("+212612345678".to_string())
        );
    }

    #[test]
    fn nine_digits_is_a_length_error() {
        assert_eq!(normalize_phone("612345678", "+212"), Err(ErrorKind::EqualLength));
        assert_eq!(
            normalize_phone("06123456789", "+212"),
            Err(ErrorKind::EqualLength)
        );
    }

    #[test]
    fn ten_digits_not_starting_with_zero_is_a_length_error() {
        assert_eq!(normalize_phone("6123456789", "+212"), Err(ErrorKind::EqualLength));
    }

    #[test]
    fn non_digits_are_an_incorrect_choice() {
        assert_eq!(
            normalize_phone("06-12-34-56-78", "+212"),
            Err(ErrorKind::IncorrectChoice)
        );
        assert_eq!(
            normalize_phone("+212612345678", "+212"),
            Err(ErrorKind::IncorrectChoice)
        );
        assert_eq!(normalize_phone("", "+212"), Err(ErrorKind::IncorrectChoice));
    }
}
