//! Positional field extraction over raw OCR lines.
//!
//! A label token is located by case-insensitive substring search; the field
//! value sits at a fixed line offset from the label (+1 for single-line
//! fields, +2 for date fields rendered as two-line blocks). The only field
//! with a fallback position is the plate number, which defaults to line
//! index 2 when no "immatriculation" label is found.
//!
//! Extraction is a pure function of the line set: same lines, same verdict.

use chrono::NaiveDate;

use crate::store::model::DocumentKind;

/// Fields read off a driver's license front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseFields {
    pub last_name: String,
    pub first_name: String,
    pub birth_date: NaiveDate,
    pub issue_date: NaiveDate,
    pub expiry_date: NaiveDate,
    pub license_number: String,
}

/// Fields read off a vehicle registration card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationFields {
    pub plate: String,
    pub make: String,
    pub color: String,
    pub first_registration: NaiveDate,
}

/// Result of the extraction + validity gate.
///
/// `Invalid` is a verdict, not a failure: the document was readable but did
/// not pass the field gates, and the caller should prompt for resubmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    License(LicenseFields),
    Registration(RegistrationFields),
    Invalid,
}

/// Fallback line index for the plate number when its label is absent.
const PLATE_FALLBACK_INDEX: usize = 2;

/// Extract typed fields from OCR lines for the given document kind.
pub fn extract(kind: DocumentKind, lines: &[String]) -> ExtractOutcome {
    match kind {
        DocumentKind::DriverLicense => extract_license(lines),
        DocumentKind::CarRegistration => extract_registration(lines),
    }
}

fn extract_license(lines: &[String]) -> ExtractOutcome {
    let Some(last_name) = labeled_value(lines, "1.", 1) else {
        return ExtractOutcome::Invalid;
    };
    let Some(first_name) = labeled_value(lines, "2.", 1) else {
        return ExtractOutcome::Invalid;
    };
    // Date fields render as two-line blocks: label, header, value.
    let Some(birth_date) = labeled_value(lines, "3.", 2).and_then(|v| parse_dmy(&v)) else {
        return ExtractOutcome::Invalid;
    };
    let Some(issue_date) = labeled_value(lines, "4a", 2).and_then(|v| parse_dmy(&v)) else {
        return ExtractOutcome::Invalid;
    };
    let Some(expiry_date) = labeled_value(lines, "4b", 2).and_then(|v| parse_dmy(&v)) else {
        return ExtractOutcome::Invalid;
    };
    let Some(license_number) = labeled_value(lines, "5.", 1) else {
        return ExtractOutcome::Invalid;
    };

    if !license_number_gate(&license_number) {
        return ExtractOutcome::Invalid;
    }

    ExtractOutcome::License(LicenseFields {
        last_name,
        first_name,
        birth_date,
        issue_date,
        expiry_date,
        license_number,
    })
}

fn extract_registration(lines: &[String]) -> ExtractOutcome {
    // Line 0 is the card title, which on standard cards ("CERTIFICAT
    // D'IMMATRICULATION") also contains the plate label; the search for the
    // label itself starts below the title.
    let plate = labeled_value(lines.get(1..).unwrap_or_default(), "immatriculation", 1)
        .or_else(|| lines.get(PLATE_FALLBACK_INDEX).cloned());
    let Some(plate) = plate else {
        return ExtractOutcome::Invalid;
    };
    let Some(make) = labeled_value(lines, "marque", 1) else {
        return ExtractOutcome::Invalid;
    };
    let Some(color) = labeled_value(lines, "couleur", 1) else {
        return ExtractOutcome::Invalid;
    };
    let Some(first_registration) =
        labeled_value(lines, "mise en circulation", 2).and_then(|v| parse_dmy(&v))
    else {
        return ExtractOutcome::Invalid;
    };

    if !plate_gate(&plate) {
        return ExtractOutcome::Invalid;
    }

    ExtractOutcome::Registration(RegistrationFields {
        plate,
        make,
        color,
        first_registration,
    })
}

/// Find the line containing `label` (case-insensitive) and return the line
/// `offset` below it, trimmed.
fn labeled_value(lines: &[String], label: &str, offset: usize) -> Option<String> {
    let label_lower = label.to_lowercase();
    let idx = lines
        .iter()
        .position(|l| l.to_lowercase().contains(&label_lower))?;
    lines
        .get(idx + offset)
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

/// Validity gate for plate numbers: at least one letter AND one digit.
fn plate_gate(plate: &str) -> bool {
    plate.chars().any(|c| c.is_alphabetic()) && plate.chars().any(|c| c.is_ascii_digit())
}

/// Validity gate for license numbers: letter + digit, and exactly two dashes.
fn license_number_gate(number: &str) -> bool {
    plate_gate(number) && number.chars().filter(|c| *c == '-').count() == 2
}

/// Normalize a `day-month-year` triple to a calendar date. No other date
/// format is accepted from this pipeline.
fn parse_dmy(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%d-%m-%Y").ok()
}
