//! Reservation documents and their field-level validation
//!
//! A [`Reservation`] is the only persisted entity. It carries three
//! independent status enums (confirmation, attendance, payment) plus the
//! derived lifecycle [`ReservationStatus`]. Transitions between statuses live
//! in [`crate::transitions`]; this module only owns shape and validation.

use crate::error::{ReservationError, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_NAME_LENGTH: usize = 120;
const MAX_NOTES_LENGTH: usize = 500;
const MAX_PARTY_SIZE: u32 = 100;
const ID_RANDOM_LEN: usize = 6;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Fallback business names used when a create request omits one.
pub const BUSINESS_NAMES: [&str; 5] = [
    "Le Petit Bistrot",
    "Sakura Sushi Bar",
    "Terraza Mediterranea",
    "Golden Dragon Restaurant",
    "Café de Paris",
];

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ReservationError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(ReservationError::InvalidInput(format!(
                        "Invalid {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

wire_enum! {
    /// Overall lifecycle shown on the dashboard.
    ReservationStatus {
        Pending => "pending",
        Confirmed => "confirmed",
        Cancelled => "cancelled",
        Completed => "completed",
    }
}

wire_enum! {
    /// Whether the customer (or business) has accepted the booking.
    ConfirmationStatus {
        Pending => "pending",
        Confirmed => "confirmed",
        Cancelled => "cancelled",
    }
}

wire_enum! {
    AttendanceStatus {
        NotArrived => "not_arrived",
        Arrived => "arrived",
        NoShow => "no_show",
    }
}

wire_enum! {
    PaymentStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

/// A reservation document.
///
/// The confirmation token is never serialized: it is stored in its own
/// column and only ever leaves the service inside a confirmation URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub reservation_id: String,
    pub business_name: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub date: NaiveDate,
    pub time: String,
    pub number_of_people: u32,
    pub status: ReservationStatus,
    pub confirmation_status: ConfirmationStatus,
    pub attendance_status: AttendanceStatus,
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub loyalty_tokens_sent: bool,
    #[serde(skip_serializing, default)]
    pub confirmation_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockchain_reservation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of writes applied to this document
    pub version: u64,
}

/// Create payload sent by the business dashboard.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReservation {
    #[serde(default)]
    pub business_name: Option<String>,
    pub customer_name: String,
    pub customer_phone: String,
    pub date: NaiveDate,
    pub time: String,
    pub number_of_people: u32,
    #[serde(default)]
    pub notes: Option<String>,
    /// Also register the reservation with the settlement contract.
    #[serde(default)]
    pub register_on_chain: bool,
    /// Decimal amount the customer pays on confirmation (contract side).
    #[serde(default)]
    pub payment_amount: Option<String>,
}

/// Descriptive fields a business may edit after creation. Statuses are not
/// reachable through this payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReservationUpdate {
    pub business_name: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub date: Option<NaiveDate>,
    pub time: Option<String>,
    pub number_of_people: Option<u32>,
    pub notes: Option<String>,
}

impl Reservation {
    /// Build a fresh pending reservation from a validated create payload.
    pub fn new(input: NewReservation) -> Result<Self> {
        let business_name = match input.business_name {
            Some(name) => validate_name("businessName", &name)?,
            None => random_business_name().to_string(),
        };
        let customer_name = validate_name("customerName", &input.customer_name)?;
        let customer_phone = validate_phone(&input.customer_phone)?;
        let time = normalize_time(&input.time)?;
        validate_party_size(input.number_of_people)?;
        let notes = normalize_notes(input.notes)?;

        let now = Utc::now();
        Ok(Reservation {
            reservation_id: generate_reservation_id(),
            business_name,
            customer_name,
            customer_phone,
            date: input.date,
            time,
            number_of_people: input.number_of_people,
            status: ReservationStatus::Pending,
            confirmation_status: ConfirmationStatus::Pending,
            attendance_status: AttendanceStatus::NotArrived,
            payment_status: PaymentStatus::Pending,
            loyalty_tokens_sent: false,
            confirmation_token: generate_confirmation_token(),
            notes,
            blockchain_reservation_id: None,
            transaction_hash: None,
            customer_address: None,
            created_at: now,
            updated_at: now,
            version: 1,
        })
    }

    /// Apply an edit of descriptive fields, validating each supplied value.
    pub fn apply_update(&mut self, update: ReservationUpdate) -> Result<()> {
        if let Some(name) = update.business_name {
            self.business_name = validate_name("businessName", &name)?;
        }
        if let Some(name) = update.customer_name {
            self.customer_name = validate_name("customerName", &name)?;
        }
        if let Some(phone) = update.customer_phone {
            self.customer_phone = validate_phone(&phone)?;
        }
        if let Some(date) = update.date {
            self.date = date;
        }
        if let Some(time) = update.time {
            self.time = normalize_time(&time)?;
        }
        if let Some(people) = update.number_of_people {
            validate_party_size(people)?;
            self.number_of_people = people;
        }
        if update.notes.is_some() {
            self.notes = normalize_notes(update.notes)?;
        }
        Ok(())
    }

    /// Bump timestamp and version ahead of a write.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version = self.version.saturating_add(1);
    }

    /// Reservation date and time as a unix timestamp (UTC).
    pub fn starts_at_unix(&self) -> Result<u64> {
        let time = NaiveTime::parse_from_str(&self.time, "%H:%M")
            .map_err(|e| ReservationError::InvalidInput(format!("Invalid time: {}", e)))?;
        let ts = self.date.and_time(time).and_utc().timestamp();
        u64::try_from(ts)
            .map_err(|_| ReservationError::InvalidInput("Reservation predates epoch".to_string()))
    }
}

fn validate_name(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ReservationError::InvalidInput(format!(
            "{} cannot be empty",
            field
        )));
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(ReservationError::InvalidInput(format!(
            "{} too long (max {} characters)",
            field, MAX_NAME_LENGTH
        )));
    }
    Ok(trimmed.to_string())
}

/// Validate a phone number: optional `+90` or `0` prefix followed by exactly
/// ten digits, whitespace ignored. Returns the compacted number.
pub fn validate_phone(phone: &str) -> Result<String> {
    let compact: String = phone.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = compact
        .strip_prefix("+90")
        .or_else(|| {
            // "0" + ten digits only; a bare ten-digit number may itself start with 0
            if compact.len() == 11 {
                compact.strip_prefix('0')
            } else {
                None
            }
        })
        .unwrap_or(&compact);

    if digits.len() != 10 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ReservationError::InvalidInput(format!(
            "Invalid phone number '{}'",
            phone
        )));
    }
    Ok(compact)
}

/// Normalize `H:M` style input into zero-padded `HH:MM`.
pub fn normalize_time(time: &str) -> Result<String> {
    let invalid = || ReservationError::InvalidInput(format!("Invalid time '{}'", time));
    let (hours, minutes) = time.trim().split_once(':').ok_or_else(invalid)?;
    // Accept "19:00:00" by ignoring a seconds component
    let minutes = minutes.split(':').next().unwrap_or(minutes);
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    Ok(format!("{:02}:{:02}", hours, minutes))
}

fn validate_party_size(people: u32) -> Result<()> {
    if people == 0 {
        return Err(ReservationError::InvalidInput(
            "numberOfPeople must be at least 1".to_string(),
        ));
    }
    if people > MAX_PARTY_SIZE {
        return Err(ReservationError::InvalidInput(format!(
            "numberOfPeople cannot exceed {}",
            MAX_PARTY_SIZE
        )));
    }
    Ok(())
}

fn normalize_notes(notes: Option<String>) -> Result<Option<String>> {
    let notes = notes.and_then(|n| {
        let trimmed = n.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    });
    if let Some(ref n) = notes {
        if n.chars().count() > MAX_NOTES_LENGTH {
            return Err(ReservationError::InvalidInput(format!(
                "notes too long (max {} characters)",
                MAX_NOTES_LENGTH
            )));
        }
    }
    Ok(notes)
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

fn prefixed_id(prefix: &str) -> String {
    let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_RANDOM_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}-{}-{}", prefix, to_base36(millis), suffix).to_uppercase()
}

/// `RES-<base36 millis>-<6 random>`, uppercase.
pub fn generate_reservation_id() -> String {
    prefixed_id("RES")
}

/// `CONF-<base36 millis>-<6 random>`, uppercase.
pub fn generate_confirmation_token() -> String {
    prefixed_id("CONF")
}

pub fn random_business_name() -> &'static str {
    BUSINESS_NAMES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(BUSINESS_NAMES[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> NewReservation {
        NewReservation {
            business_name: Some("Sakura Sushi Bar".to_string()),
            customer_name: "  Ayse Kaya ".to_string(),
            customer_phone: "0532 123 45 67".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
            time: "9:5".to_string(),
            number_of_people: 4,
            notes: Some("   ".to_string()),
            register_on_chain: false,
            payment_amount: None,
        }
    }

    #[test]
    fn test_new_reservation_defaults() {
        let r = Reservation::new(sample_input()).unwrap();
        assert_eq!(r.customer_name, "Ayse Kaya");
        assert_eq!(r.customer_phone, "05321234567");
        assert_eq!(r.time, "09:05");
        assert_eq!(r.status, ReservationStatus::Pending);
        assert_eq!(r.confirmation_status, ConfirmationStatus::Pending);
        assert_eq!(r.attendance_status, AttendanceStatus::NotArrived);
        assert_eq!(r.payment_status, PaymentStatus::Pending);
        assert!(!r.loyalty_tokens_sent);
        assert!(r.notes.is_none());
        assert_eq!(r.version, 1);
        assert!(r.reservation_id.starts_with("RES-"));
        assert!(r.confirmation_token.starts_with("CONF-"));
    }

    #[test]
    fn test_missing_business_name_picks_known_one() {
        let mut input = sample_input();
        input.business_name = None;
        let r = Reservation::new(input).unwrap();
        assert!(BUSINESS_NAMES.contains(&r.business_name.as_str()));
    }

    #[test]
    fn test_generated_ids_shape() {
        let id = generate_reservation_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "RES");
        assert_eq!(parts[2].len(), ID_RANDOM_LEN);
        assert_eq!(id, id.to_uppercase());
        assert_ne!(generate_confirmation_token(), generate_confirmation_token());
    }

    #[test]
    fn test_phone_validation() {
        assert!(validate_phone("+905321234567").is_ok());
        assert!(validate_phone("05321234567").is_ok());
        assert!(validate_phone("5321234567").is_ok());
        assert!(validate_phone("532 123 45 67").is_ok());
        assert!(validate_phone("12345").is_err());
        assert!(validate_phone("+15321234567").is_err());
        assert!(validate_phone("053212345ab").is_err());
    }

    #[test]
    fn test_time_normalization() {
        assert_eq!(normalize_time("19:00").unwrap(), "19:00");
        assert_eq!(normalize_time("7:30").unwrap(), "07:30");
        assert_eq!(normalize_time("19:00:00").unwrap(), "19:00");
        assert!(normalize_time("24:00").is_err());
        assert!(normalize_time("1900").is_err());
        assert!(normalize_time("aa:bb").is_err());
    }

    #[test]
    fn test_party_size_bounds() {
        let mut input = sample_input();
        input.number_of_people = 0;
        assert!(Reservation::new(input).is_err());

        let mut input = sample_input();
        input.number_of_people = MAX_PARTY_SIZE + 1;
        assert!(Reservation::new(input).is_err());
    }

    #[test]
    fn test_token_is_not_serialized() {
        let r = Reservation::new(sample_input()).unwrap();
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("confirmationToken").is_none());
        assert_eq!(json["confirmationStatus"], "pending");
        assert_eq!(json["attendanceStatus"], "not_arrived");
        assert_eq!(json["numberOfPeople"], 4);
    }

    #[test]
    fn test_apply_update_validates_and_keeps_statuses() {
        let mut r = Reservation::new(sample_input()).unwrap();
        r.apply_update(ReservationUpdate {
            number_of_people: Some(6),
            notes: Some("window seat".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(r.number_of_people, 6);
        assert_eq!(r.notes.as_deref(), Some("window seat"));
        assert_eq!(r.status, ReservationStatus::Pending);

        let err = r
            .apply_update(ReservationUpdate {
                customer_phone: Some("bad".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ReservationError::InvalidInput(_)));
    }

    #[test]
    fn test_update_rejects_status_fields() {
        let parsed: std::result::Result<ReservationUpdate, _> =
            serde_json::from_str(r#"{"confirmationStatus":"confirmed"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_wire_enum_round_trip_from_str() {
        assert_eq!(
            "no_show".parse::<AttendanceStatus>().unwrap(),
            AttendanceStatus::NoShow
        );
        assert!("later".parse::<AttendanceStatus>().is_err());
        assert_eq!(ReservationStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn test_starts_at_unix() {
        let mut r = Reservation::new(sample_input()).unwrap();
        r.date = NaiveDate::from_ymd_opt(1970, 1, 2).unwrap();
        r.time = "00:00".to_string();
        assert_eq!(r.starts_at_unix().unwrap(), 86_400);
    }
}
