use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AccessError, MalformedEventError};

/// Position of a log in the ledger: block number, then log index within the block.
///
/// This is the only ordering authority for events. Block timestamps are carried
/// for display and never consulted when sequencing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OrderKey {
    pub block_number: u64,
    pub log_index: u32,
}

impl OrderKey {
    #[must_use]
    pub const fn new(block_number: u64, log_index: u32) -> Self {
        Self { block_number, log_index }
    }
}

impl Display for OrderKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// A 20-byte ledger address. Parsing is case-insensitive; display is lowercase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Self = Self([0; 20]);
    pub const MAX: Self = Self([0xff; 20]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parse a `0x`-prefixed, 40 hex digit address.
    ///
    /// # Errors
    /// Returns [`AccessError::InvalidAddress`] when the prefix, length, or digits are wrong.
    pub fn parse(value: &str) -> Result<Self, AccessError> {
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| AccessError::InvalidAddress(value.to_string()))?;
        if digits.len() != 40 {
            return Err(AccessError::InvalidAddress(value.to_string()));
        }

        let mut bytes = [0_u8; 20];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|_| AccessError::InvalidAddress(value.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = AccessError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for Address {
    type Error = AccessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    /// Wrap an opaque record identifier.
    ///
    /// # Errors
    /// Returns [`AccessError::InvalidRecordId`] when the identifier is blank.
    pub fn new(value: impl Into<String>) -> Result<Self, AccessError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AccessError::InvalidRecordId);
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecordId {
    type Error = AccessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RecordId> for String {
    fn from(value: RecordId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    None,
    Read,
    Write,
}

impl AccessLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    /// Contract enum ordinal: `0 = None`, `1 = Read`, `2 = Write`.
    #[must_use]
    pub fn from_ordinal(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            _ => None,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(ordinal) = value.parse::<u64>() {
            return Self::from_ordinal(ordinal);
        }
        match value.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Registered,
    Granted,
    Revoked,
    Triggered,
}

impl EventKind {
    pub const ALL: [Self; 4] = [Self::Registered, Self::Granted, Self::Revoked, Self::Triggered];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Granted => "granted",
            Self::Revoked => "revoked",
            Self::Triggered => "triggered",
        }
    }

    /// Solidity event name emitted by the registry contract.
    #[must_use]
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Registered => "RecordRegistered",
            Self::Granted => "AccessGranted",
            Self::Revoked => "AccessRevoked",
            Self::Triggered => "AccessTriggered",
        }
    }

    #[must_use]
    pub fn from_event_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.event_name() == value)
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

/// Kind-specific fields of a normalized event.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Registered,
    Granted { access_level: AccessLevel, expiration: i64 },
    Revoked { revoker: Address },
    Triggered,
}

impl EventPayload {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Registered => EventKind::Registered,
            Self::Granted { .. } => EventKind::Granted,
            Self::Revoked { .. } => EventKind::Revoked,
            Self::Triggered => EventKind::Triggered,
        }
    }
}

/// One normalized authorization event.
///
/// The derived ordering compares `order_key` first; the remaining fields only
/// break ties between distinct events that claim the same ledger position.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AuthEvent {
    pub order_key: OrderKey,
    pub payload: EventPayload,
    pub record_id: RecordId,
    /// Consumer or provider for access events; producer for registrations.
    pub subject: Address,
    pub actor_did: Option<String>,
    pub block_timestamp: Option<i64>,
}

impl AuthEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// A decoded contract log as delivered by an event source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawLog {
    pub event: String,
    pub block_number: u64,
    pub log_index: u32,
    #[serde(default)]
    pub block_timestamp: Option<i64>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl RawLog {
    #[must_use]
    pub fn order_key(&self) -> OrderKey {
        OrderKey::new(self.block_number, self.log_index)
    }

    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_event_name(&self.event)
    }
}

/// Convert one raw log into an [`AuthEvent`].
///
/// # Errors
/// Returns [`MalformedEventError`] when the event name is unknown or a field the
/// kind requires is missing or has the wrong shape.
pub fn normalize(log: &RawLog) -> Result<AuthEvent, MalformedEventError> {
    let kind = log.kind().ok_or_else(|| malformed(log, "unrecognized event signature"))?;

    let record_id = required_str(log, "recordId")?;
    let record_id = RecordId::new(record_id).map_err(|err| malformed(log, &err.to_string()))?;

    let (subject, payload) = match kind {
        EventKind::Registered => (address_arg(log, &["producer", "owner"])?, EventPayload::Registered),
        EventKind::Granted => {
            let subject = address_arg(log, &["consumer", "provider"])?;
            let access_level = level_arg(log, "accessLevel")?;
            let expiration = timestamp_arg(log, "expiration")?;
            (subject, EventPayload::Granted { access_level, expiration })
        }
        EventKind::Revoked => {
            let subject = address_arg(log, &["consumer", "provider"])?;
            let revoker = address_arg(log, &["revoker"])?;
            (subject, EventPayload::Revoked { revoker })
        }
        EventKind::Triggered => {
            (address_arg(log, &["consumer", "provider"])?, EventPayload::Triggered)
        }
    };

    let actor_did = ["consumerDid", "did"]
        .iter()
        .find_map(|name| log.args.get(*name).and_then(Value::as_str))
        .filter(|did| !did.trim().is_empty())
        .map(str::to_string);

    Ok(AuthEvent {
        order_key: log.order_key(),
        payload,
        record_id,
        subject,
        actor_did,
        block_timestamp: log.block_timestamp,
    })
}

/// Normalize a whole batch; the first malformed log fails the batch.
///
/// # Errors
/// Returns the [`MalformedEventError`] of the first log that cannot be normalized.
pub fn normalize_batch<'a, I>(logs: I) -> Result<Vec<AuthEvent>, MalformedEventError>
where
    I: IntoIterator<Item = &'a RawLog>,
{
    logs.into_iter().map(normalize).collect()
}

fn malformed(log: &RawLog, reason: &str) -> MalformedEventError {
    MalformedEventError {
        event: log.event.clone(),
        order_key: log.order_key(),
        reason: reason.to_string(),
    }
}

fn required_str<'a>(log: &'a RawLog, name: &str) -> Result<&'a str, MalformedEventError> {
    match log.args.get(name) {
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(malformed(log, &format!("`{name}` MUST be a string"))),
        None => Err(malformed(log, &format!("missing required field `{name}`"))),
    }
}

fn address_arg(log: &RawLog, names: &[&str]) -> Result<Address, MalformedEventError> {
    let Some((name, value)) =
        names.iter().find_map(|name| log.args.get(*name).map(|value| (*name, value)))
    else {
        return Err(malformed(log, &format!("missing required field `{}`", names[0])));
    };

    let Value::String(raw) = value else {
        return Err(malformed(log, &format!("`{name}` MUST be an address string")));
    };
    Address::parse(raw).map_err(|err| malformed(log, &format!("`{name}`: {err}")))
}

fn level_arg(log: &RawLog, name: &str) -> Result<AccessLevel, MalformedEventError> {
    let level = match log.args.get(name) {
        Some(Value::Number(number)) => number.as_u64().and_then(AccessLevel::from_ordinal),
        Some(Value::String(raw)) => AccessLevel::parse(raw),
        Some(_) => None,
        None => return Err(malformed(log, &format!("missing required field `{name}`"))),
    };
    level.ok_or_else(|| malformed(log, &format!("`{name}` is not a known access level")))
}

fn timestamp_arg(log: &RawLog, name: &str) -> Result<i64, MalformedEventError> {
    let value = match log.args.get(name) {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(raw)) => raw.trim().parse::<i64>().ok(),
        Some(_) => None,
        None => return Err(malformed(log, &format!("missing required field `{name}`"))),
    };

    match value {
        Some(seconds) if seconds >= 0 => Ok(seconds),
        _ => Err(malformed(log, &format!("`{name}` MUST be non-negative unix seconds"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONSUMER: &str = "0xAaAaaAAaaaAAaaAAaAaaAAaAaaAAAaaAAaaAaAaA";
    const PRODUCER: &str = "0x1111111111111111111111111111111111111111";

    fn raw(event: &str, args: Value) -> RawLog {
        let Value::Object(args) = args else {
            panic!("fixture args must be a JSON object");
        };
        RawLog {
            event: event.to_string(),
            block_number: 42,
            log_index: 3,
            block_timestamp: Some(1_700_000_000),
            transaction_hash: None,
            args,
        }
    }

    fn expect_malformed(log: &RawLog, expected_substring: &str) {
        let err = match normalize(log) {
            Ok(event) => panic!("expected malformed event, got {event:?}"),
            Err(err) => err,
        };
        assert!(
            err.to_string().contains(expected_substring),
            "error `{err}` did not contain `{expected_substring}`"
        );
    }

    #[test]
    fn address_parsing_is_case_insensitive() {
        let upper = Address::parse(CONSUMER);
        let lower = Address::parse(&CONSUMER.to_ascii_lowercase());
        assert_eq!(upper, lower);
        let rendered = match upper {
            Ok(address) => address.to_string(),
            Err(err) => panic!("fixture address should parse: {err}"),
        };
        assert_eq!(rendered, CONSUMER.to_ascii_lowercase());
    }

    #[test]
    fn address_parsing_rejects_short_and_unprefixed_values() {
        assert!(Address::parse("0xAAA").is_err());
        assert!(Address::parse("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").is_err());
        assert!(Address::parse("0xzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz").is_err());
    }

    #[test]
    fn granted_log_normalizes_with_order_key_from_position() {
        let log = raw(
            "AccessGranted",
            serde_json::json!({
                "recordId": "r1",
                "consumer": CONSUMER,
                "consumerDid": "did:ledup:consumer:1",
                "accessLevel": 2,
                "expiration": "1700003600"
            }),
        );

        let event = match normalize(&log) {
            Ok(event) => event,
            Err(err) => panic!("granted log should normalize: {err}"),
        };
        assert_eq!(event.order_key, OrderKey::new(42, 3));
        assert_eq!(event.kind(), EventKind::Granted);
        assert_eq!(
            event.payload,
            EventPayload::Granted { access_level: AccessLevel::Write, expiration: 1_700_003_600 }
        );
        assert_eq!(event.actor_did.as_deref(), Some("did:ledup:consumer:1"));
        assert_eq!(event.block_timestamp, Some(1_700_000_000));
    }

    #[test]
    fn granted_log_without_expiration_is_malformed() {
        let log = raw(
            "AccessGranted",
            serde_json::json!({ "recordId": "r1", "consumer": CONSUMER, "accessLevel": "Read" }),
        );
        expect_malformed(&log, "missing required field `expiration`");
    }

    #[test]
    fn revoked_log_requires_revoker() {
        let log =
            raw("AccessRevoked", serde_json::json!({ "recordId": "r1", "consumer": CONSUMER }));
        expect_malformed(&log, "missing required field `revoker`");
    }

    #[test]
    fn provider_is_accepted_as_subject_alias() {
        let log = raw(
            "AccessTriggered",
            serde_json::json!({ "recordId": "r1", "provider": CONSUMER }),
        );
        let event = match normalize(&log) {
            Ok(event) => event,
            Err(err) => panic!("triggered log should normalize: {err}"),
        };
        assert_eq!(event.kind(), EventKind::Triggered);
        assert_eq!(Some(event.subject), Address::parse(CONSUMER).ok());
    }

    #[test]
    fn registered_log_uses_producer_as_subject() {
        let log = raw(
            "RecordRegistered",
            serde_json::json!({ "recordId": "r1", "producer": PRODUCER, "did": "did:ledup:p" }),
        );
        let event = match normalize(&log) {
            Ok(event) => event,
            Err(err) => panic!("registered log should normalize: {err}"),
        };
        assert_eq!(event.payload, EventPayload::Registered);
        assert_eq!(Some(event.subject), Address::parse(PRODUCER).ok());
    }

    #[test]
    fn unknown_signature_and_bad_level_are_malformed() {
        let unknown = raw("DataShared", serde_json::json!({ "recordId": "r1" }));
        expect_malformed(&unknown, "unrecognized event signature");

        let bad_level = raw(
            "AccessGranted",
            serde_json::json!({
                "recordId": "r1",
                "consumer": CONSUMER,
                "accessLevel": 7,
                "expiration": 10
            }),
        );
        expect_malformed(&bad_level, "not a known access level");

        let negative = raw(
            "AccessGranted",
            serde_json::json!({
                "recordId": "r1",
                "consumer": CONSUMER,
                "accessLevel": 1,
                "expiration": -5
            }),
        );
        expect_malformed(&negative, "non-negative unix seconds");
    }

    #[test]
    fn normalize_batch_fails_on_first_malformed_log() {
        let good = raw(
            "AccessTriggered",
            serde_json::json!({ "recordId": "r1", "consumer": CONSUMER }),
        );
        let bad = raw("AccessTriggered", serde_json::json!({ "recordId": "" }));

        match normalize_batch([&good, &bad]) {
            Ok(events) => panic!("batch should fail, got {} events", events.len()),
            Err(err) => assert!(err.to_string().contains("record id MUST be non-empty")),
        }
    }

    #[test]
    fn access_level_parses_ordinals_and_names() {
        assert_eq!(AccessLevel::parse("1"), Some(AccessLevel::Read));
        assert_eq!(AccessLevel::parse("WRITE"), Some(AccessLevel::Write));
        assert_eq!(AccessLevel::parse("admin"), None);
        assert!(AccessLevel::None < AccessLevel::Read && AccessLevel::Read < AccessLevel::Write);
    }
}
