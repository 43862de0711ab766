//! Document extraction: remote OCR plus positional field extraction.

pub mod fields;
pub mod ocr;

pub use fields::{ExtractOutcome, LicenseFields, RegistrationFields, extract};
pub use ocr::{OcrSpaceClient, TextRecognizer};
