//! Record types, field kinds and the per-field processing table

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::Result;

/// Prefix of every field policy key
pub const POLICY_PREFIX: &str = "kratool.ldif.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// CA enrollment request
    Enrollment,
    /// Key recovery request
    Recovery,
    /// TPS server-side key generation request
    Keygen,
    /// TPS key recovery request
    KeyRecovery,
    /// Key archived by a CA
    CaKeyRecord,
    /// Key archived by a TPS
    TpsKeyRecord,
    /// Anything else
    Generic,
}

impl RecordType {
    pub const ALL: [RecordType; 7] = [
        RecordType::Enrollment,
        RecordType::Recovery,
        RecordType::Keygen,
        RecordType::KeyRecovery,
        RecordType::CaKeyRecord,
        RecordType::TpsKeyRecord,
        RecordType::Generic,
    ];

    /// Name used in field policy keys; `None` for [`RecordType::Generic`]
    pub fn policy_name(&self) -> Option<&'static str> {
        match self {
            Self::Enrollment => Some("caEnrollmentRequest"),
            Self::Recovery => Some("recoveryRequest"),
            Self::Keygen => Some("tpsNetkeyKeygenRequest"),
            Self::KeyRecovery => Some("tpsNetkeyKeyRecoveryRequest"),
            Self::CaKeyRecord => Some("caKeyRecord"),
            Self::TpsKeyRecord => Some("tpsKeyRecord"),
            Self::Generic => None,
        }
    }

    /// Classify a record from its `requestType:` or `archivedBy:` line
    ///
    /// The last discriminator wins. Unrecognised values are logged and the
    /// record is treated as generic.
    pub fn detect<S: AsRef<str>>(lines: &[S]) -> RecordType {
        let mut record_type = RecordType::Generic;
        for line in lines {
            let line = line.as_ref();
            if let Some(value) = attribute_value(line, REQUEST_TYPE) {
                record_type = match value {
                    "enrollment" => RecordType::Enrollment,
                    "recovery" => RecordType::Recovery,
                    "netkeyKeygen" => RecordType::Keygen,
                    "netkeyKeyRecovery" => RecordType::KeyRecovery,
                    other => {
                        warn!(request_type = %other, "unknown LDIF request type, treating record as generic");
                        RecordType::Generic
                    }
                };
            } else if let Some(value) = attribute_value(line, ARCHIVED_BY) {
                record_type = if value.starts_with("TPS") {
                    RecordType::TpsKeyRecord
                } else if value.starts_with("CA") {
                    RecordType::CaKeyRecord
                } else {
                    warn!(archived_by = %value, "unable to determine key record type, treating record as generic");
                    RecordType::Generic
                };
            }
        }
        record_type
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.policy_name().unwrap_or("generic"))
    }
}

const REQUEST_TYPE: &str = "requestType:";
const ARCHIVED_BY: &str = "archivedBy:";

fn attribute_value<'a>(line: &'a str, attribute: &str) -> Option<&'a str> {
    line.strip_prefix(attribute).map(str::trim)
}

/// Attributes the transform may rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Cn,
    DateOfModify,
    Dn,
    ExtdataKeyRecord,
    ExtdataRequestId,
    ExtdataRequestNotes,
    ExtdataSerialNumber,
    PrivateKeyData,
    RequestId,
    SerialNo,
}

impl FieldKind {
    pub const ALL: [FieldKind; 10] = [
        FieldKind::Cn,
        FieldKind::DateOfModify,
        FieldKind::Dn,
        FieldKind::ExtdataKeyRecord,
        FieldKind::ExtdataRequestId,
        FieldKind::ExtdataRequestNotes,
        FieldKind::ExtdataSerialNumber,
        FieldKind::PrivateKeyData,
        FieldKind::RequestId,
        FieldKind::SerialNo,
    ];

    /// LDIF attribute prefix
    pub fn attribute(&self) -> &'static str {
        match self {
            Self::Cn => "cn:",
            Self::DateOfModify => "dateOfModify:",
            Self::Dn => "dn:",
            Self::ExtdataKeyRecord => "extdata-keyrecord:",
            Self::ExtdataRequestId => "extdata-requestid:",
            Self::ExtdataRequestNotes => "extdata-requestnotes:",
            Self::ExtdataSerialNumber => "extdata-serialnumber:",
            Self::PrivateKeyData => "privateKeyData::",
            Self::RequestId => "requestId:",
            Self::SerialNo => "serialno:",
        }
    }

    /// Name used in field policy keys
    pub fn policy_name(&self) -> &'static str {
        match self {
            Self::Cn => "cn",
            Self::DateOfModify => "dateOfModify",
            Self::Dn => "dn",
            Self::ExtdataKeyRecord => "extdata.keyRecord",
            Self::ExtdataRequestId => "extdata.requestId",
            Self::ExtdataRequestNotes => "extdata.requestNotes",
            Self::ExtdataSerialNumber => "extdata.serialnumber",
            Self::PrivateKeyData => "privateKeyData",
            Self::RequestId => "requestId",
            Self::SerialNo => "serialno",
        }
    }
}

/// How a field is handled for a record type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    /// Rewritten when enabled in the [`FieldPolicy`]
    Configurable,
    /// Always copied unchanged
    PassThrough,
    /// Not expected in this record type; logged and copied unchanged
    Mismatched,
}

/// Processing rule for `field` in a record of `record_type`
pub fn field_rule(record_type: RecordType, field: FieldKind) -> FieldRule {
    use FieldKind as F;
    use FieldRule::*;
    use RecordType as R;

    match (field, record_type) {
        (F::Cn | F::Dn, R::Generic) => PassThrough,
        (F::DateOfModify, R::Generic) => Mismatched,
        (F::Cn | F::Dn | F::DateOfModify, _) => Configurable,
        (F::ExtdataKeyRecord, R::Enrollment | R::Keygen) => Configurable,
        (F::ExtdataRequestId, R::Enrollment) => PassThrough,
        (F::ExtdataRequestId, R::Recovery | R::Keygen | R::KeyRecovery) => Configurable,
        (
            F::ExtdataRequestNotes | F::RequestId,
            R::Enrollment | R::Recovery | R::Keygen | R::KeyRecovery,
        ) => Configurable,
        (F::ExtdataSerialNumber, R::Recovery) => Configurable,
        (F::PrivateKeyData, R::CaKeyRecord | R::TpsKeyRecord) => Configurable,
        (F::SerialNo, R::CaKeyRecord | R::TpsKeyRecord) => Configurable,
        (F::SerialNo, R::Generic) => PassThrough,
        _ => Mismatched,
    }
}

/// Record types that receive a synthesized notes line when theirs is missing
pub fn synthesizes_notes(record_type: RecordType) -> bool {
    matches!(
        record_type,
        RecordType::Recovery | RecordType::Keygen | RecordType::KeyRecovery
    )
}

/// Which configurable fields the transform rewrites
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPolicy {
    enabled: HashSet<(RecordType, FieldKind)>,
}

impl Default for FieldPolicy {
    fn default() -> Self {
        Self::all_enabled()
    }
}

impl FieldPolicy {
    /// Every configurable field enabled
    pub fn all_enabled() -> Self {
        FieldPolicy {
            enabled: configurable_pairs().collect(),
        }
    }

    /// Every field disabled
    pub fn none() -> Self {
        FieldPolicy {
            enabled: HashSet::new(),
        }
    }

    /// Parse `kratool.ldif.<recordType>.<field>=true|false` lines
    ///
    /// Keys that do not name a configurable field are ignored, as is every
    /// line outside the `kratool.ldif.` namespace. Fields not mentioned stay
    /// disabled.
    pub fn parse(config: &str) -> Self {
        let mut policy = Self::none();
        for line in config.lines() {
            let line = line.trim();
            if !line.starts_with(POLICY_PREFIX) {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            match lookup_key(name.trim()) {
                Some(pair) => {
                    let enabled = value.trim() == "true";
                    policy.set(pair.0, pair.1, enabled);
                }
                None => debug!(key = %name, "ignoring unknown field policy key"),
            }
        }
        policy
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = std::fs::read_to_string(path)?;
        Ok(Self::parse(&config))
    }

    pub fn set(&mut self, record_type: RecordType, field: FieldKind, enabled: bool) {
        if enabled && field_rule(record_type, field) == FieldRule::Configurable {
            self.enabled.insert((record_type, field));
        } else {
            self.enabled.remove(&(record_type, field));
        }
    }

    pub fn is_enabled(&self, record_type: RecordType, field: FieldKind) -> bool {
        self.enabled.contains(&(record_type, field))
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.len()
    }
}

fn configurable_pairs() -> impl Iterator<Item = (RecordType, FieldKind)> {
    RecordType::ALL.into_iter().flat_map(|record_type| {
        FieldKind::ALL
            .into_iter()
            .filter(move |field| field_rule(record_type, *field) == FieldRule::Configurable)
            .map(move |field| (record_type, field))
    })
}

/// Full policy key for a configurable pair
pub fn policy_key(record_type: RecordType, field: FieldKind) -> Option<String> {
    record_type
        .policy_name()
        .map(|name| format!("{}{}.{}", POLICY_PREFIX, name, field.policy_name()))
}

fn lookup_key(key: &str) -> Option<(RecordType, FieldKind)> {
    configurable_pairs().find(|(record_type, field)| {
        policy_key(*record_type, *field).as_deref() == Some(key)
    })
}
