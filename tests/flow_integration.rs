//! End-to-end conversation tests against the in-memory backend, with mock
//! transport, OCR, and partner platform.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use driver_onboard::catalog::{FlowId, build_catalog};
use driver_onboard::channels::{InboundMessage, Messenger};
use driver_onboard::config::EngineConfig;
use driver_onboard::engine::Engine;
use driver_onboard::error::{ChannelError, OcrError, PartnerError};
use driver_onboard::extract::TextRecognizer;
use driver_onboard::partner::{PartnerClient, ProfileRequest, VehicleRequest};
use driver_onboard::store::model::{
    Car, CarAssociation, Driver, HistoryReason, HistoryStatus,
};
use driver_onboard::store::{Database, LibSqlBackend};

const USER: &str = "212600000001";

// ── Mocks ───────────────────────────────────────────────────────────

#[derive(Default)]
struct MockMessenger {
    sent: Mutex<Vec<(String, String)>>,
    fail_next_send: AtomicBool,
}

impl MockMessenger {
    async fn last(&self) -> String {
        self.sent.lock().await.last().map(|(_, b)| b.clone()).unwrap_or_default()
    }

    async fn count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError> {
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                to: to.to_string(),
                reason: "gateway unavailable".to_string(),
            });
        }
        self.sent.lock().await.push((to.to_string(), body.to_string()));
        Ok(())
    }

    async fn send_image(
        &self,
        to: &str,
        _media_url: &str,
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .await
            .push((to.to_string(), caption.unwrap_or_default().to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct MockRecognizer {
    by_url: Mutex<HashMap<String, Vec<String>>>,
}

impl MockRecognizer {
    async fn stub(&self, url: &str, lines: &[&str]) {
        self.by_url
            .lock()
            .await
            .insert(url.to_string(), lines.iter().map(|s| s.to_string()).collect());
    }
}

#[async_trait]
impl TextRecognizer for MockRecognizer {
    async fn recognize(&self, image_url: &str) -> Result<Vec<String>, OcrError> {
        self.by_url
            .lock()
            .await
            .get(image_url)
            .cloned()
            .ok_or(OcrError::EmptyResult)
    }
}

#[derive(Default)]
struct MockPartner {
    fail_create_vehicle: AtomicBool,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl PartnerClient for MockPartner {
    async fn create_vehicle(&self, _req: &VehicleRequest) -> Result<String, PartnerError> {
        self.calls.lock().await.push("create_vehicle".to_string());
        if self.fail_create_vehicle.load(Ordering::SeqCst) {
            return Err(PartnerError::UnexpectedStatus {
                call: "create_vehicle".to_string(),
                status: 500,
            });
        }
        Ok("veh-1".to_string())
    }

    async fn create_profile(&self, _req: &ProfileRequest) -> Result<String, PartnerError> {
        self.calls.lock().await.push("create_profile".to_string());
        Ok("prof-1".to_string())
    }

    async fn bind_vehicle(&self, _profile_id: &str, _vehicle_id: &str) -> Result<(), PartnerError> {
        self.calls.lock().await.push("bind_vehicle".to_string());
        Ok(())
    }

    async fn get_profile(&self, _profile_id: &str) -> Result<serde_json::Value, PartnerError> {
        self.calls.lock().await.push("get_profile".to_string());
        Ok(serde_json::json!({"id": "prof-1"}))
    }

    async fn update_phone(&self, _profile_id: &str, _phone: &str) -> Result<(), PartnerError> {
        self.calls.lock().await.push("update_phone".to_string());
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    engine: Engine,
    store: Arc<dyn Database>,
    messenger: Arc<MockMessenger>,
    recognizer: Arc<MockRecognizer>,
    partner: Arc<MockPartner>,
}

async fn harness() -> Harness {
    harness_with(EngineConfig {
        send_throttle: Duration::ZERO,
        ..EngineConfig::default()
    })
    .await
}

async fn harness_with(config: EngineConfig) -> Harness {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let messenger = Arc::new(MockMessenger::default());
    let recognizer = Arc::new(MockRecognizer::default());
    let partner = Arc::new(MockPartner::default());
    let engine = Engine::new(
        Arc::clone(&store),
        Arc::clone(&messenger) as Arc<dyn Messenger>,
        Arc::clone(&recognizer) as Arc<dyn TextRecognizer>,
        Arc::clone(&partner) as Arc<dyn PartnerClient>,
        Arc::new(build_catalog()),
        config,
    );
    Harness {
        engine,
        store,
        messenger,
        recognizer,
        partner,
    }
}

fn text(id: &str, body: &str) -> InboundMessage {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "type": "text",
        "from": USER,
        "text": { "body": body }
    }))
    .unwrap()
}

fn image(id: &str, media_id: &str, link: &str) -> InboundMessage {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "type": "image",
        "from": USER,
        "image": { "id": media_id, "link": link, "file_size": 120_000 }
    }))
    .unwrap()
}

const LICENSE_LINES: &[&str] = &[
    "PERMIS DE CONDUIRE",
    "1.",
    "ALAMI",
    "2.",
    "YASSINE",
    "3.",
    "Date de naissance",
    "12-03-1990",
    "4a",
    "Delivre le",
    "01-06-2015",
    "4b",
    "Valable jusqu'au",
    "01-06-2035",
    "5.",
    "04-B1-567890",
];

const CARTE_GRISE_LINES: &[&str] = &[
    "CARTE GRISE",
    "Numero d'immatriculation",
    "1234-A-56",
    "Marque",
    "DACIA",
    "Couleur",
    "BLANC",
    "Premiere mise en circulation",
    "Date",
    "15-01-2018",
];

/// Walk a fresh user through registration up to the given level.
async fn registration_to_level(h: &Harness, level: u8) {
    h.engine.advance(&text("m1", "start")).await.unwrap();
    if level <= 1 {
        return;
    }
    h.engine.advance(&text("m2", "1")).await.unwrap();
    if level <= 2 {
        return;
    }
    h.engine.advance(&text("m3", "0612345678")).await.unwrap();
    if level <= 3 {
        return;
    }
    let code = h
        .store
        .latest_otp("+212612345678")
        .await
        .unwrap()
        .unwrap()
        .code;
    h.engine.advance(&text("m4", &code)).await.unwrap();
    if level <= 4 {
        return;
    }
    h.recognizer.stub("https://cdn/front.jpg", LICENSE_LINES).await;
    h.engine
        .advance(&image("m5", "media-front", "https://cdn/front.jpg"))
        .await
        .unwrap();
    if level <= 5 {
        return;
    }
    h.engine
        .advance(&image("m6", "media-back", "https://cdn/back.jpg"))
        .await
        .unwrap();
    if level <= 6 {
        return;
    }
    h.recognizer.stub("https://cdn/cg.jpg", CARTE_GRISE_LINES).await;
    h.engine
        .advance(&image("m7", "media-cg", "https://cdn/cg.jpg"))
        .await
        .unwrap();
}

/// Seed an already-provisioned driver with an active vehicle.
async fn seed_provisioned_driver(store: &Arc<dyn Database>, phone: &str) -> Driver {
    let now = Utc::now();
    let driver = Driver {
        id: Uuid::new_v4(),
        phone: phone.to_string(),
        first_name: "Yassine".to_string(),
        last_name: "Alami".to_string(),
        birth_date: None,
        remote_profile_id: Some("prof-1".to_string()),
        created_at: now,
    };
    store.insert_driver(&driver).await.unwrap();
    let car = Car {
        id: Uuid::new_v4(),
        plate: "9999-Z-99".to_string(),
        make: "RENAULT".to_string(),
        color: "GRIS".to_string(),
        first_registration: None,
        remote_vehicle_id: Some("veh-0".to_string()),
        created_at: now,
    };
    store.insert_car(&car).await.unwrap();
    store
        .insert_association(&CarAssociation {
            id: Uuid::new_v4(),
            driver_id: driver.id,
            car_id: car.id,
            start_date: now,
            end_date: None,
        })
        .await
        .unwrap();
    driver
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn start_with_no_history_gets_root_prompt() {
    let h = harness().await;
    h.engine.advance(&text("m1", "start")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("1. Register as a driver"), "got: {last}");
    let row = h.store.current_row(USER).await.unwrap().unwrap();
    assert_eq!(row.level, 0);
}

#[tokio::test]
async fn unknown_input_with_no_history_is_ignored() {
    let h = harness().await;
    h.engine.advance(&text("m1", "hello?")).await.unwrap();
    assert_eq!(h.messenger.count().await, 0);
    assert!(h.store.current_row(USER).await.unwrap().is_none());
}

#[tokio::test]
async fn nine_digit_phone_gets_equal_length_retry() {
    let h = harness().await;
    registration_to_level(&h, 2).await;

    h.engine.advance(&text("m3", "612345678")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("10-digit"), "got: {last}");
    let row = h.store.current_row(USER).await.unwrap().unwrap();
    assert_eq!(row.level, 1, "still at the phone step");
    assert_eq!(row.bad_response_count, 1);
}

#[tokio::test]
async fn two_strikes_abort_to_agent_handoff() {
    let h = harness().await;
    registration_to_level(&h, 2).await;

    h.engine.advance(&text("m3", "612345678")).await.unwrap();
    h.engine.advance(&text("m4", "612345678")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("contact one of our agents"), "got: {last}");
    assert!(h.store.current_row(USER).await.unwrap().is_none());

    let history = h.store.history_rows(USER).await.unwrap();
    assert_eq!(history[0].status, HistoryStatus::Fail);
    assert_eq!(history[0].reason, Some(HistoryReason::Error));
}

#[tokio::test]
async fn valid_input_between_strikes_resets_escalation() {
    let h = harness().await;
    registration_to_level(&h, 2).await;

    h.engine.advance(&text("m3", "612345678")).await.unwrap();
    h.engine.advance(&text("m4", "0612345678")).await.unwrap();

    let row = h.store.current_row(USER).await.unwrap().unwrap();
    assert_eq!(row.level, 2, "advanced to the OTP step");
    assert_eq!(row.bad_response_count, 0, "fresh row, fresh count");
    assert_eq!(row.message, "+212612345678", "normalized phone stored");
}

#[tokio::test]
async fn wrong_otp_code_gets_retry_message() {
    let h = harness().await;
    registration_to_level(&h, 3).await;

    h.engine.advance(&text("m4", "000000")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("not correct"), "got: {last}");
    let row = h.store.current_row(USER).await.unwrap().unwrap();
    assert_eq!(row.level, 2);
    assert_eq!(row.bad_response_count, 1);
}

#[tokio::test]
async fn registration_happy_path_provisions_account() {
    let h = harness().await;
    registration_to_level(&h, 7).await;

    // Confirmation prompt carries the extracted summary
    let prompt = h.messenger.last().await;
    assert!(prompt.contains("DACIA"), "got: {prompt}");
    assert!(prompt.contains("1234-A-56"), "got: {prompt}");
    assert!(prompt.contains("YASSINE ALAMI"), "got: {prompt}");

    h.engine.advance(&text("m8", "1")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("all set"), "got: {last}");
    assert!(h.store.current_row(USER).await.unwrap().is_none());

    let driver = h
        .store
        .find_driver_by_phone("+212612345678")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(driver.remote_profile_id.as_deref(), Some("prof-1"));

    let assoc = h.store.active_association(driver.id).await.unwrap().unwrap();
    let car = h.store.find_car(assoc.car_id).await.unwrap().unwrap();
    assert_eq!(car.remote_vehicle_id.as_deref(), Some("veh-1"));
    assert_eq!(car.plate, "1234-A-56");

    let docs = h.store.documents_for_owner(USER).await.unwrap();
    assert_eq!(docs.len(), 3);
    assert!(docs.iter().all(|d| d.driver_id == Some(driver.id)));

    let history = h.store.history_rows(USER).await.unwrap();
    assert_eq!(history[0].status, HistoryStatus::Succeeded);
    assert_eq!(history[0].reason, Some(HistoryReason::NormalFinish));

    let calls = h.partner.calls.lock().await.clone();
    assert_eq!(calls, vec!["create_vehicle", "create_profile", "bind_vehicle"]);
}

#[tokio::test]
async fn unreadable_carte_grise_gets_resubmission_prompt() {
    let h = harness().await;
    registration_to_level(&h, 6).await;

    // Plate token has no digit, so the validity gate rejects it
    h.recognizer
        .stub(
            "https://cdn/bad.jpg",
            &[
                "CARTE GRISE",
                "Numero d'immatriculation",
                "ABCDEF",
                "Marque",
                "DACIA",
                "Couleur",
                "BLANC",
                "Premiere mise en circulation",
                "Date",
                "15-01-2018",
            ],
        )
        .await;
    h.engine
        .advance(&image("m7", "media-bad", "https://cdn/bad.jpg"))
        .await
        .unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("couldn't read the registration card"), "got: {last}");

    let row = h.store.current_row(USER).await.unwrap().unwrap();
    assert_eq!(row.level, 5, "still waiting for the carte grise");
    assert_eq!(row.bad_response_count, 0, "gate failures are not strikes");

    let driver = h
        .store
        .find_driver_by_phone("+212612345678")
        .await
        .unwrap()
        .unwrap();
    assert!(
        h.store.active_association(driver.id).await.unwrap().is_none(),
        "no car record from a rejected document"
    );
}

#[tokio::test]
async fn text_at_an_image_step_is_invalid() {
    let h = harness().await;
    registration_to_level(&h, 4).await;

    h.engine.advance(&text("m5", "here you go")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("send a photo"), "got: {last}");
    let row = h.store.current_row(USER).await.unwrap().unwrap();
    assert_eq!(row.level, 3);
    assert_eq!(row.bad_response_count, 1);
}

#[tokio::test]
async fn oversized_image_is_rejected() {
    let h = harness().await;
    registration_to_level(&h, 4).await;

    let msg: InboundMessage = serde_json::from_value(serde_json::json!({
        "id": "m5",
        "type": "image",
        "from": USER,
        "image": { "id": "huge", "link": "https://cdn/huge.jpg", "file_size": 50_000_000u64 }
    }))
    .unwrap();
    h.engine.advance(&msg).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("too large"), "got: {last}");
    assert_eq!(
        h.store.current_row(USER).await.unwrap().unwrap().level,
        3
    );
}

#[tokio::test]
async fn saga_create_vehicle_failure_compensates() {
    let h = harness().await;
    registration_to_level(&h, 7).await;

    h.partner.fail_create_vehicle.store(true, Ordering::SeqCst);
    h.engine.advance(&text("m8", "1")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("Something went wrong"), "got: {last}");
    assert!(h.store.current_row(USER).await.unwrap().is_none());

    // Creation rollback removes the whole attempt
    assert!(
        h.store
            .find_driver_by_phone("+212612345678")
            .await
            .unwrap()
            .is_none()
    );
    assert!(h.store.documents_for_owner(USER).await.unwrap().is_empty());

    let history = h.store.history_rows(USER).await.unwrap();
    assert_eq!(history[0].status, HistoryStatus::Fail);
    assert_eq!(history[0].reason, Some(HistoryReason::Error));
}

#[tokio::test]
async fn back_and_resubmit_then_saga_failure_rolls_back_both_cars() {
    let h = harness().await;
    registration_to_level(&h, 7).await;

    // Revisit the carte grise step and submit a second card
    h.engine.advance(&text("m8", "back")).await.unwrap();
    h.recognizer.stub("https://cdn/cg-2.jpg", CARTE_GRISE_LINES).await;
    h.engine
        .advance(&image("m9", "media-cg-2", "https://cdn/cg-2.jpg"))
        .await
        .unwrap();

    let driver = h
        .store
        .find_driver_by_phone("+212612345678")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        h.store.associations_for_driver(driver.id).await.unwrap().len(),
        2,
        "first submission ended, second active"
    );

    h.partner.fail_create_vehicle.store(true, Ordering::SeqCst);
    h.engine.advance(&text("m10", "1")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("Something went wrong"), "got: {last}");
    assert!(h.store.current_row(USER).await.unwrap().is_none());
    assert!(
        h.store
            .associations_for_driver(driver.id)
            .await
            .unwrap()
            .is_empty(),
        "both submissions rolled back"
    );
    assert!(
        h.store
            .find_driver_by_phone("+212612345678")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn back_to_license_front_resubmission_replaces_attempt() {
    let h = harness().await;
    registration_to_level(&h, 7).await;

    // Walk back from confirmation to the license-front step
    h.engine.advance(&text("m8", "back")).await.unwrap();
    h.engine.advance(&text("m9", "back")).await.unwrap();
    h.engine.advance(&text("m10", "back")).await.unwrap();

    let stale = h
        .store
        .find_driver_by_phone("+212612345678")
        .await
        .unwrap()
        .unwrap();

    h.recognizer.stub("https://cdn/front-2.jpg", LICENSE_LINES).await;
    h.engine
        .advance(&image("m11", "media-front-2", "https://cdn/front-2.jpg"))
        .await
        .unwrap();

    let fresh = h
        .store
        .find_driver_by_phone("+212612345678")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(fresh.id, stale.id, "stale attempt records replaced");
    assert!(
        h.store
            .associations_for_driver(stale.id)
            .await
            .unwrap()
            .is_empty(),
        "vehicle records from the abandoned pass removed"
    );
    assert_eq!(
        h.store.current_row(USER).await.unwrap().unwrap().level,
        4,
        "back at the license-back step"
    );
}

#[tokio::test]
async fn stop_mid_flow_rolls_back_and_returns_to_menu() {
    let h = harness().await;
    registration_to_level(&h, 5).await;

    h.engine.advance(&text("m9", "stop")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("What would you like to do"), "got: {last}");

    let row = h.store.current_row(USER).await.unwrap().unwrap();
    assert_eq!(row.level, 0, "back at the menu");

    assert!(
        h.store
            .find_driver_by_phone("+212612345678")
            .await
            .unwrap()
            .is_none(),
        "collected driver rolled back"
    );
    assert!(h.store.documents_for_owner(USER).await.unwrap().is_empty());
}

#[tokio::test]
async fn back_returns_to_previous_step_prompt() {
    let h = harness().await;
    registration_to_level(&h, 3).await;

    h.engine.advance(&text("m9", "back")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("What is your phone number"), "got: {last}");
    assert_eq!(
        h.store.current_row(USER).await.unwrap().unwrap().level,
        1
    );
}

#[tokio::test]
async fn reaper_expires_idle_conversation() {
    let h = harness_with(EngineConfig {
        send_throttle: Duration::ZERO,
        ledger_ttl: Duration::ZERO,
        ..EngineConfig::default()
    })
    .await;
    registration_to_level(&h, 3).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.reap_idle().await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("expired due to inactivity"), "got: {last}");
    assert!(h.store.current_row(USER).await.unwrap().is_none());
    assert!(
        h.store.latest_otp("+212612345678").await.unwrap().is_none(),
        "pending OTP rolled back"
    );

    let history = h.store.history_rows(USER).await.unwrap();
    assert_eq!(history[0].status, HistoryStatus::Fail);
    assert_eq!(history[0].reason, Some(HistoryReason::TimeLimitReached));
}

#[tokio::test]
async fn reaper_leaves_fresh_conversations_alone() {
    let h = harness().await;
    registration_to_level(&h, 2).await;

    h.engine.reap_idle().await.unwrap();

    assert!(h.store.current_row(USER).await.unwrap().is_some());
}

#[tokio::test]
async fn vehicle_change_swaps_active_association() {
    let h = harness().await;
    let driver = seed_provisioned_driver(&h.store, "+212612345678").await;
    let old_assoc = h.store.active_association(driver.id).await.unwrap().unwrap();

    h.engine.advance(&text("m1", "start")).await.unwrap();
    h.engine.advance(&text("m2", "2")).await.unwrap();
    h.engine.advance(&text("m3", "0612345678")).await.unwrap();
    let code = h
        .store
        .latest_otp("+212612345678")
        .await
        .unwrap()
        .unwrap()
        .code;
    h.engine.advance(&text("m4", &code)).await.unwrap();
    h.recognizer.stub("https://cdn/cg2.jpg", CARTE_GRISE_LINES).await;
    h.engine
        .advance(&image("m5", "media-cg2", "https://cdn/cg2.jpg"))
        .await
        .unwrap();
    h.engine.advance(&text("m6", "1")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("vehicle has been updated"), "got: {last}");

    let active = h.store.active_association(driver.id).await.unwrap().unwrap();
    assert_ne!(active.id, old_assoc.id);
    let car = h.store.find_car(active.car_id).await.unwrap().unwrap();
    assert_eq!(car.plate, "1234-A-56");
    assert_eq!(car.remote_vehicle_id.as_deref(), Some("veh-1"));

    let calls = h.partner.calls.lock().await.clone();
    assert_eq!(
        calls,
        vec!["create_vehicle", "bind_vehicle"],
        "existing profile is reused, never re-created"
    );
}

#[tokio::test]
async fn vehicle_change_saga_failure_restores_previous_vehicle() {
    let h = harness().await;
    let driver = seed_provisioned_driver(&h.store, "+212612345678").await;
    let old_assoc = h.store.active_association(driver.id).await.unwrap().unwrap();

    h.engine.advance(&text("m1", "start")).await.unwrap();
    h.engine.advance(&text("m2", "2")).await.unwrap();
    h.engine.advance(&text("m3", "0612345678")).await.unwrap();
    let code = h
        .store
        .latest_otp("+212612345678")
        .await
        .unwrap()
        .unwrap()
        .code;
    h.engine.advance(&text("m4", &code)).await.unwrap();
    h.recognizer.stub("https://cdn/cg2.jpg", CARTE_GRISE_LINES).await;
    h.engine
        .advance(&image("m5", "media-cg2", "https://cdn/cg2.jpg"))
        .await
        .unwrap();

    h.partner.fail_create_vehicle.store(true, Ordering::SeqCst);
    h.engine.advance(&text("m6", "1")).await.unwrap();

    let active = h.store.active_association(driver.id).await.unwrap().unwrap();
    assert_eq!(active.id, old_assoc.id, "previous association restored");
    assert_eq!(active.car_id, old_assoc.car_id);

    // The confirmed driver record survives an UPDATE rollback
    assert!(
        h.store
            .find_driver_by_phone("+212612345678")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn unregistered_phone_cannot_change_vehicle() {
    let h = harness().await;
    h.engine.advance(&text("m1", "start")).await.unwrap();
    h.engine.advance(&text("m2", "2")).await.unwrap();
    h.engine.advance(&text("m3", "0612345678")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("couldn't find an account"), "got: {last}");
    assert_eq!(
        h.store.current_row(USER).await.unwrap().unwrap().level,
        1
    );
}

#[tokio::test]
async fn phone_change_happy_path_updates_number() {
    let h = harness().await;
    let driver = seed_provisioned_driver(&h.store, "+212612345678").await;

    h.engine.advance(&text("m1", "start")).await.unwrap();
    h.engine.advance(&text("m2", "3")).await.unwrap();
    h.engine.advance(&text("m3", "0612345678")).await.unwrap();
    h.engine.advance(&text("m4", "0699999999")).await.unwrap();
    let code = h
        .store
        .latest_otp("+212699999999")
        .await
        .unwrap()
        .unwrap()
        .code;
    h.engine.advance(&text("m5", &code)).await.unwrap();

    let prompt = h.messenger.last().await;
    assert!(prompt.contains("+212699999999"), "got: {prompt}");

    h.engine.advance(&text("m6", "1")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("phone number has been updated"), "got: {last}");

    assert!(
        h.store
            .find_driver_by_phone("+212612345678")
            .await
            .unwrap()
            .is_none()
    );
    let moved = h
        .store
        .find_driver_by_phone("+212699999999")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.id, driver.id);

    let calls = h.partner.calls.lock().await.clone();
    assert_eq!(calls, vec!["get_profile", "update_phone"]);
}

#[tokio::test]
async fn cancel_at_confirmation_returns_to_menu() {
    let h = harness().await;
    registration_to_level(&h, 7).await;

    h.engine.advance(&text("m8", "2")).await.unwrap();

    let last = h.messenger.last().await;
    assert!(last.contains("What would you like to do"), "got: {last}");
    assert_eq!(
        h.store.current_row(USER).await.unwrap().unwrap().level,
        0
    );
    assert!(
        h.store
            .find_driver_by_phone("+212612345678")
            .await
            .unwrap()
            .is_none(),
        "declined attempt rolled back"
    );

    let history = h.store.history_rows(USER).await.unwrap();
    assert_eq!(history[0].status, HistoryStatus::Fail);
    assert_eq!(history[0].reason, Some(HistoryReason::NormalFinish));
}

#[tokio::test]
async fn inbox_drain_processes_in_arrival_order() {
    let h = harness().await;

    let start = serde_json::to_value(text("m1", "start")).unwrap();
    let pick = serde_json::to_value(text("m2", "1")).unwrap();
    assert!(h.store.enqueue_inbox("m1", &start).await.unwrap());
    assert!(h.store.enqueue_inbox("m2", &pick).await.unwrap());
    assert!(
        !h.store.enqueue_inbox("m1", &start).await.unwrap(),
        "duplicate delivery is dropped"
    );

    h.engine.drain_inbox().await.unwrap();

    assert!(h.store.next_inbox_entry().await.unwrap().is_none());
    let row = h.store.current_row(USER).await.unwrap().unwrap();
    assert_eq!(row.level, 1, "both messages applied in order");
    let last = h.messenger.last().await;
    assert!(last.contains("What is your phone number"), "got: {last}");
}

#[tokio::test]
async fn send_failure_after_ledger_advance_drops_entry_without_strike() {
    let h = harness().await;
    let start = serde_json::to_value(text("m1", "start")).unwrap();
    h.store.enqueue_inbox("m1", &start).await.unwrap();
    h.engine.drain_inbox().await.unwrap();

    // The flow choice validates and the ledger advances, then the outbound
    // prompt fails
    let pick = serde_json::to_value(text("m2", "1")).unwrap();
    h.store.enqueue_inbox("m2", &pick).await.unwrap();
    h.messenger.fail_next_send.store(true, Ordering::SeqCst);
    h.engine.drain_inbox().await.unwrap();

    assert!(
        h.store.next_inbox_entry().await.unwrap().is_none(),
        "the entry is not retried against the advanced step"
    );
    let row = h.store.current_row(USER).await.unwrap().unwrap();
    assert_eq!(row.flow, FlowId::Registration);
    assert_eq!(row.level, 1);
    assert_eq!(row.bad_response_count, 0, "no strike burned");
}

#[tokio::test]
async fn undecodable_inbox_entry_is_dropped() {
    let h = harness().await;
    let garbage = serde_json::json!({"not": "an envelope"});
    h.store.enqueue_inbox("g1", &garbage).await.unwrap();

    h.engine.drain_inbox().await.unwrap();

    assert!(h.store.next_inbox_entry().await.unwrap().is_none());
}
