//! Seed definitions for every flow and step.
//!
//! These are configuration, not user-authored data. Changing a prompt or a
//! retry message means changing this file and redeploying.

use std::collections::HashMap;

use super::model::{
    AGENT_HANDOFF_LEVEL, Catalog, ErrorKind, FlowId, Step, StepKey,
};

struct StepDef {
    flow: FlowId,
    level: u8,
    prompt: &'static str,
    media_url: Option<&'static str>,
    bad: &'static [(ErrorKind, &'static str)],
    resubmit: Option<&'static str>,
}

const PHONE_BAD_LENGTH: &str =
    "That doesn't look like a valid phone number. Please send your 10-digit number, e.g. 0612345678.";
const PHONE_NOT_DIGITS: &str = "Please send your phone number as digits only, e.g. 0612345678.";
const OTP_WRONG: &str = "That code is not correct. Please check the message we sent and try again.";
const OTP_EXPIRED: &str = "That code has expired. We just sent you a new one — please enter it.";
const IMAGE_EXPECTED: &str = "Please send a photo, not text.";
const IMAGE_TOO_BIG: &str = "That photo is too large. Please send a photo under 5 MB.";
const CHOICE_BAD: &str = "Please reply with one of the numbered options.";

static STEP_DEFS: &[StepDef] = &[
    // ── Shared ──────────────────────────────────────────────────────
    StepDef {
        flow: FlowId::Root,
        level: 0,
        prompt: "Welcome! What would you like to do?\n\
                 1. Register as a driver\n\
                 2. Change my vehicle\n\
                 3. Change my phone number\n\
                 Reply with 1, 2 or 3. You can send \"stop\" at any time to cancel.",
        media_url: None,
        bad: &[(ErrorKind::IncorrectChoice, CHOICE_BAD)],
        resubmit: None,
    },
    StepDef {
        flow: FlowId::Root,
        level: AGENT_HANDOFF_LEVEL,
        prompt: "We couldn't complete your request automatically. \
                 Please contact one of our agents and we'll finish this together.",
        media_url: None,
        bad: &[],
        resubmit: None,
    },
    // ── Registration ────────────────────────────────────────────────
    StepDef {
        flow: FlowId::Registration,
        level: 1,
        prompt: "Let's get you registered. What is your phone number? (e.g. 0612345678)",
        media_url: None,
        bad: &[
            (ErrorKind::EqualLength, PHONE_BAD_LENGTH),
            (ErrorKind::IncorrectChoice, PHONE_NOT_DIGITS),
            (
                ErrorKind::IsExist,
                "This number is already registered. Send \"stop\" and pick another option, \
                 or contact an agent.",
            ),
        ],
        resubmit: None,
    },
    StepDef {
        flow: FlowId::Registration,
        level: 2,
        prompt: "We sent a verification code to {phone}. Please enter it.",
        media_url: None,
        bad: &[
            (ErrorKind::IncorrectCode, OTP_WRONG),
            (ErrorKind::IsExpired, OTP_EXPIRED),
        ],
        resubmit: None,
    },
    StepDef {
        flow: FlowId::Registration,
        level: 3,
        prompt: "Thanks! Now send a clear photo of the FRONT of your driver's license.",
        media_url: None,
        bad: &[
            (ErrorKind::IncorrectChoice, IMAGE_EXPECTED),
            (ErrorKind::MaxSize, IMAGE_TOO_BIG),
        ],
        resubmit: Some(
            "We couldn't read that license photo. Please retake it in good light \
             and send the FRONT side again.",
        ),
    },
    StepDef {
        flow: FlowId::Registration,
        level: 4,
        prompt: "Got it. Now send a photo of the BACK of your driver's license.",
        media_url: None,
        bad: &[
            (ErrorKind::IncorrectChoice, IMAGE_EXPECTED),
            (ErrorKind::MaxSize, IMAGE_TOO_BIG),
        ],
        resubmit: None,
    },
    StepDef {
        flow: FlowId::Registration,
        level: 5,
        prompt: "Almost there. Send a photo of your vehicle registration card (carte grise).",
        media_url: None,
        bad: &[
            (ErrorKind::IncorrectChoice, IMAGE_EXPECTED),
            (ErrorKind::MaxSize, IMAGE_TOO_BIG),
        ],
        resubmit: Some(
            "We couldn't read the registration card. Please retake the photo and \
             make sure the plate number is visible.",
        ),
    },
    StepDef {
        flow: FlowId::Registration,
        level: 6,
        prompt: "Please confirm your details:\n\
                 Name: {name}\n\
                 License: {license}\n\
                 Vehicle: {make} {color}, plate {plate}\n\
                 1. Confirm\n\
                 2. Cancel",
        media_url: None,
        bad: &[(ErrorKind::IncorrectChoice, CHOICE_BAD)],
        resubmit: None,
    },
    // ── Vehicle change ──────────────────────────────────────────────
    StepDef {
        flow: FlowId::VehicleChange,
        level: 1,
        prompt: "Let's update your vehicle. What is the phone number you registered with?",
        media_url: None,
        bad: &[
            (ErrorKind::EqualLength, PHONE_BAD_LENGTH),
            (ErrorKind::IncorrectChoice, PHONE_NOT_DIGITS),
            (
                ErrorKind::IsNotExist,
                "We couldn't find an account with this number. Check the number or \
                 register first (send \"stop\" then pick option 1).",
            ),
        ],
        resubmit: None,
    },
    StepDef {
        flow: FlowId::VehicleChange,
        level: 2,
        prompt: "We sent a verification code to {phone}. Please enter it.",
        media_url: None,
        bad: &[
            (ErrorKind::IncorrectCode, OTP_WRONG),
            (ErrorKind::IsExpired, OTP_EXPIRED),
        ],
        resubmit: None,
    },
    StepDef {
        flow: FlowId::VehicleChange,
        level: 3,
        prompt: "Send a photo of the new vehicle's registration card (carte grise).",
        media_url: None,
        bad: &[
            (ErrorKind::IncorrectChoice, IMAGE_EXPECTED),
            (ErrorKind::MaxSize, IMAGE_TOO_BIG),
        ],
        resubmit: Some(
            "We couldn't read the registration card. Please retake the photo and \
             make sure the plate number is visible.",
        ),
    },
    StepDef {
        flow: FlowId::VehicleChange,
        level: 4,
        prompt: "Replace your current vehicle with:\n\
                 {make} {color}, plate {plate}\n\
                 1. Confirm\n\
                 2. Cancel",
        media_url: None,
        bad: &[(ErrorKind::IncorrectChoice, CHOICE_BAD)],
        resubmit: None,
    },
    // ── Phone change ────────────────────────────────────────────────
    StepDef {
        flow: FlowId::PhoneChange,
        level: 1,
        prompt: "Let's change your phone number. What is your CURRENT registered number?",
        media_url: None,
        bad: &[
            (ErrorKind::EqualLength, PHONE_BAD_LENGTH),
            (ErrorKind::IncorrectChoice, PHONE_NOT_DIGITS),
            (
                ErrorKind::IsNotExist,
                "We couldn't find an account with this number. Check the number or \
                 register first (send \"stop\" then pick option 1).",
            ),
        ],
        resubmit: None,
    },
    StepDef {
        flow: FlowId::PhoneChange,
        level: 2,
        prompt: "What is your NEW phone number?",
        media_url: None,
        bad: &[
            (ErrorKind::EqualLength, PHONE_BAD_LENGTH),
            (ErrorKind::IncorrectChoice, PHONE_NOT_DIGITS),
            (
                ErrorKind::IsExist,
                "This number is already in use on another account. Please use a \
                 different number.",
            ),
        ],
        resubmit: None,
    },
    StepDef {
        flow: FlowId::PhoneChange,
        level: 3,
        prompt: "We sent a verification code to your new number {phone}. Please enter it.",
        media_url: None,
        bad: &[
            (ErrorKind::IncorrectCode, OTP_WRONG),
            (ErrorKind::IsExpired, OTP_EXPIRED),
        ],
        resubmit: None,
    },
    StepDef {
        flow: FlowId::PhoneChange,
        level: 4,
        prompt: "Change your number to {phone}?\n1. Confirm\n2. Cancel",
        media_url: None,
        bad: &[(ErrorKind::IncorrectChoice, CHOICE_BAD)],
        resubmit: None,
    },
];

/// Build the immutable catalog from the seed definitions.
pub fn build_catalog() -> Catalog {
    let steps = STEP_DEFS
        .iter()
        .map(|def| Step {
            key: StepKey::new(def.flow, def.level),
            prompt: def.prompt.to_string(),
            media_url: def.media_url.map(String::from),
            bad_responses: def
                .bad
                .iter()
                .map(|(k, v)| (*k, v.to_string()))
                .collect::<HashMap<_, _>>(),
            resubmit_message: def.resubmit.map(String::from),
        })
        .collect();
    Catalog::new(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_covers_all_flows() {
        let catalog = build_catalog();
        assert_eq!(catalog.last_level(FlowId::Registration), 6);
        assert_eq!(catalog.last_level(FlowId::VehicleChange), 4);
        assert_eq!(catalog.last_level(FlowId::PhoneChange), 4);
        // Shared steps
        assert!(catalog.get(FlowId::Root, 0).is_some());
        assert!(catalog.get(FlowId::Root, AGENT_HANDOFF_LEVEL).is_some());
    }

    #[test]
    fn no_gaps_in_flow_levels() {
        let catalog = build_catalog();
        for flow in [
            FlowId::Registration,
            FlowId::VehicleChange,
            FlowId::PhoneChange,
        ] {
            for level in 1..=catalog.last_level(flow) {
                assert!(
                    catalog.get(flow, level).is_some(),
                    "{flow} is missing level {level}"
                );
            }
        }
    }

    #[test]
    fn phone_steps_carry_length_retry_message() {
        let catalog = build_catalog();
        for (flow, level) in [
            (FlowId::Registration, 1),
            (FlowId::VehicleChange, 1),
            (FlowId::PhoneChange, 1),
            (FlowId::PhoneChange, 2),
        ] {
            let step = catalog.get(flow, level).unwrap();
            assert!(
                step.bad_response(ErrorKind::EqualLength).is_some(),
                "{flow} L{level} must configure equal_length"
            );
        }
    }

    #[test]
    fn otp_steps_carry_code_retry_messages() {
        let catalog = build_catalog();
        for (flow, level) in [
            (FlowId::Registration, 2),
            (FlowId::VehicleChange, 2),
            (FlowId::PhoneChange, 3),
        ] {
            let step = catalog.get(flow, level).unwrap();
            assert!(step.bad_response(ErrorKind::IncorrectCode).is_some());
            assert!(step.bad_response(ErrorKind::IsExpired).is_some());
        }
    }

    #[test]
    fn image_steps_cap_size() {
        let catalog = build_catalog();
        for (flow, level) in [
            (FlowId::Registration, 3),
            (FlowId::Registration, 4),
            (FlowId::Registration, 5),
            (FlowId::VehicleChange, 3),
        ] {
            let step = catalog.get(flow, level).unwrap();
            assert!(step.bad_response(ErrorKind::MaxSize).is_some());
        }
    }

    #[test]
    fn document_steps_carry_resubmit_messages() {
        let catalog = build_catalog();
        // Extraction runs on license front and registration card
        assert!(
            catalog
                .get(FlowId::Registration, 3)
                .unwrap()
                .resubmit_message
                .is_some()
        );
        assert!(
            catalog
                .get(FlowId::Registration, 5)
                .unwrap()
                .resubmit_message
                .is_some()
        );
        assert!(
            catalog
                .get(FlowId::VehicleChange, 3)
                .unwrap()
                .resubmit_message
                .is_some()
        );
    }
}
