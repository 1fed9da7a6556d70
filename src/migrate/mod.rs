//! KRA record migration
//!
//! Rewrites an exported KRA LDIF stream for import into another KRA:
//! identifiers are shifted by an offset, archived session keys are moved to
//! the target storage key, naming contexts are renamed, and every touched
//! request is annotated with an audit note.
//!
//! # Example
//!
//! ```no_run
//! use std::io::{BufReader, BufWriter};
//! use kra_core::migrate::{transform, IdOffset, TransformOptions};
//! use kra_core::rsa::BigUint;
//!
//! # fn main() -> kra_core::Result<()> {
//! let input = BufReader::new(std::fs::File::open("source.ldif")?);
//! let output = BufWriter::new(std::fs::File::create("target.ldif")?);
//!
//! let options = TransformOptions {
//!     id_offset: Some(IdOffset::append(BigUint::from(100_000_000_000u64))),
//!     ..TransformOptions::default()
//! };
//! let report = transform(input, output, &options)?;
//! println!("{} records written", report.records_written);
//! # Ok(())
//! # }
//! ```

mod fields;
mod ldif;
mod notes;
mod offset;
mod rewrap;

pub use fields::{field_rule, policy_key, FieldKind, FieldPolicy, FieldRule, RecordType};
pub use ldif::{LineCursor, RecordReader};
pub use notes::{append_note, fold_ldif, AuditNote};
pub use offset::{
    apply_offset, compose_numeric_line, indexed_from_db, indexed_to_db, IdOffset, OffsetMode,
    MAX_INDEXED_DIGITS,
};
pub use rewrap::{RewrapOptions, TargetPublicKey};

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{KraError, Result};
use notes::{NOTES_FIRST_LINE_LEN, PRIVATE_KEY_DATA_FIRST_LINE_LEN};

const DN_EMBEDDED_CN: &str = "dn: cn";
const EXTDATA_REQUEST_TYPE: &str = "extdata-requesttype:";
const AUTH_TOKEN_USER: &str = "extdata-auth--005ftoken;user:";
const AUTH_TOKEN_USER_DN: &str = "extdata-auth--005ftoken;userdn:";

/// `dateOfModify` format, UTC
pub const DATE_OF_MODIFY_FORMAT: &str = "%Y%m%d%H%M%SZ";

/// Current time as a `dateOfModify` value
pub fn date_of_modify_now() -> String {
    Utc::now().format(DATE_OF_MODIFY_FORMAT).to_string()
}

/// Replace one KRA naming context with another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingContextRewrite {
    pub source: String,
    pub target: String,
}

impl NamingContextRewrite {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        NamingContextRewrite {
            source: source.into(),
            target: target.into(),
        }
    }

    fn apply(&self, line: &str) -> String {
        line.replace(&self.source, &self.target)
    }
}

#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub id_offset: Option<IdOffset>,
    /// Drop records that are neither requests nor key records
    pub requests_and_keys_only: bool,
    pub naming_context: Option<NamingContextRewrite>,
    pub rewrap: Option<RewrapOptions>,
    pub field_policy: FieldPolicy,
    /// Replacement `dateOfModify` value, also stamped on audit notes
    pub date_of_modify: String,
    /// Set to stop the run between records
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        TransformOptions {
            id_offset: None,
            requests_and_keys_only: false,
            naming_context: None,
            rewrap: None,
            field_policy: FieldPolicy::all_enabled(),
            date_of_modify: date_of_modify_now(),
            cancel: None,
        }
    }
}

impl TransformOptions {
    pub fn validate(&self) -> Result<()> {
        if self.rewrap.is_none() && self.id_offset.is_none() {
            return Err(KraError::InvalidConfig(
                "a rewrap target or an ID offset is required".to_string(),
            ));
        }
        if let Some(rename) = &self.naming_context {
            if rename.source.is_empty() {
                return Err(KraError::InvalidConfig(
                    "source naming context must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn audit_note(&self) -> String {
        AuditNote {
            date: &self.date_of_modify,
            rewrap_bits: self.rewrap.as_ref().map(|rewrap| rewrap.target.bits()),
            used_password_file: self
                .rewrap
                .as_ref()
                .map_or(false, |rewrap| rewrap.used_password_file),
            id_offset: self.id_offset.as_ref(),
            naming_context: self.naming_context.as_ref(),
            requests_and_keys_only: self.requests_and_keys_only,
        }
        .render()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }
}

/// Outcome of a [`transform`] run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformReport {
    pub run_id: Uuid,
    pub records_read: u64,
    pub records_written: u64,
    pub records_dropped: u64,
    pub fields_changed: u64,
    pub keys_rewrapped: u64,
    pub notes_appended: u64,
    pub notes_synthesized: u64,
    pub fields_mismatched: u64,
    /// Fields copied unchanged because their stored value was malformed
    pub fields_skipped: u64,
    /// False when the run was cancelled
    pub completed: bool,
}

impl TransformReport {
    fn new() -> Self {
        TransformReport {
            run_id: Uuid::new_v4(),
            records_read: 0,
            records_written: 0,
            records_dropped: 0,
            fields_changed: 0,
            keys_rewrapped: 0,
            notes_appended: 0,
            notes_synthesized: 0,
            fields_mismatched: 0,
            fields_skipped: 0,
            completed: false,
        }
    }
}

/// Rewrite every record of `input` into `output`
///
/// Records are processed one at a time. Offset policy violations, indexed
/// overflows and rewrap failures abort the run; output written so far is
/// flushed but incomplete. Malformed stored values are logged and copied
/// unchanged.
pub fn transform<R: BufRead, W: Write>(
    input: R,
    mut output: W,
    options: &TransformOptions,
) -> Result<TransformReport> {
    options.validate()?;

    let note = options.audit_note();
    let mut report = TransformReport::new();
    info!(run_id = %report.run_id, note = %note, "BEGIN record transform");

    let mut records = RecordReader::new(input);
    let mut cancelled = false;
    let result = loop {
        if options.is_cancelled() {
            cancelled = true;
            break Ok(());
        }
        let lines = match records.next_record() {
            Ok(Some(lines)) => lines,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        if lines.iter().all(|line| line.is_empty()) {
            if let Err(e) = write_lines(&mut output, &lines) {
                break Err(e);
            }
            continue;
        }

        report.records_read += 1;
        let record_type = RecordType::detect(&lines);
        if record_type == RecordType::Generic && options.requests_and_keys_only {
            debug!("dropping record which is neither a request nor a key record");
            report.records_dropped += 1;
            continue;
        }

        let mut record = RecordTransform {
            options,
            note: &note,
            record_type,
            report: &mut report,
            output: &mut output,
            previous: None,
        };
        if let Err(e) = record.run(LineCursor::new(lines)) {
            break Err(e);
        }
        report.records_written += 1;
    };

    output.flush()?;
    result?;

    if cancelled {
        warn!(run_id = %report.run_id, records = report.records_read, "record transform cancelled");
    } else {
        report.completed = true;
        info!(
            run_id = %report.run_id,
            records = report.records_written,
            dropped = report.records_dropped,
            rewrapped = report.keys_rewrapped,
            "FINISHED record transform"
        );
    }
    Ok(report)
}

fn write_lines<W: Write>(output: &mut W, lines: &[String]) -> Result<()> {
    for line in lines {
        writeln!(output, "{}", line)?;
    }
    Ok(())
}

/// Field-by-field rewrite of one record
struct RecordTransform<'a, W> {
    options: &'a TransformOptions,
    note: &'a str,
    record_type: RecordType,
    report: &'a mut TransformReport,
    output: &'a mut W,
    /// First line of the previously emitted attribute
    previous: Option<String>,
}

impl<W: Write> RecordTransform<'_, W> {
    fn run(&mut self, mut cursor: LineCursor) -> Result<()> {
        while let Some(line) = cursor.next_line() {
            let field = FieldKind::ALL
                .into_iter()
                .find(|field| line.starts_with(field.attribute()));

            match field {
                Some(FieldKind::Cn) => self.numeric(FieldKind::Cn, " ", false, line)?,
                Some(FieldKind::DateOfModify) => self.date_of_modify(line)?,
                Some(FieldKind::Dn) => self.dn(line)?,
                Some(FieldKind::ExtdataKeyRecord) => {
                    self.numeric(FieldKind::ExtdataKeyRecord, " ", false, line)?
                }
                Some(FieldKind::ExtdataRequestId) => {
                    self.numeric(FieldKind::ExtdataRequestId, " ", false, line)?
                }
                Some(FieldKind::ExtdataRequestNotes) => self.request_notes(line, &mut cursor)?,
                Some(FieldKind::ExtdataSerialNumber) => {
                    self.numeric(FieldKind::ExtdataSerialNumber, " ", false, line)?
                }
                Some(FieldKind::PrivateKeyData) => self.private_key_data(line, &mut cursor)?,
                Some(FieldKind::RequestId) => self.numeric(FieldKind::RequestId, " ", true, line)?,
                Some(FieldKind::SerialNo) => self.numeric(FieldKind::SerialNo, " ", true, line)?,
                None if line.starts_with(EXTDATA_REQUEST_TYPE) => self.request_type(line)?,
                None if self.follows_auth_token() => self.auth_token_value(line)?,
                None => self.emit(vec![line])?,
            }
        }
        Ok(())
    }

    /// Write an attribute's lines and remember its first line
    fn emit(&mut self, lines: Vec<String>) -> Result<()> {
        write_lines(&mut *self.output, &lines)?;
        self.previous = lines.into_iter().next();
        Ok(())
    }

    fn emit_changed(&mut self, original: &str, revised: String) -> Result<()> {
        if revised != original {
            self.report.fields_changed += 1;
        }
        self.emit(vec![revised])
    }

    /// Whether `field` should be rewritten in this record
    fn enabled(&mut self, field: FieldKind) -> bool {
        match field_rule(self.record_type, field) {
            FieldRule::Configurable => self
                .options
                .field_policy
                .is_enabled(self.record_type, field),
            FieldRule::PassThrough => false,
            FieldRule::Mismatched => {
                warn!(
                    field = field.attribute(),
                    record_type = %self.record_type,
                    "mismatched record field, copying unchanged"
                );
                self.report.fields_mismatched += 1;
                false
            }
        }
    }

    fn numeric(&mut self, field: FieldKind, delimiter: &str, indexed: bool, line: String) -> Result<()> {
        if !self.enabled(field) {
            return self.emit(vec![line]);
        }
        let revised = compose_numeric_line(
            field.attribute(),
            delimiter,
            &line,
            indexed,
            self.options.id_offset.as_ref(),
        );
        match revised {
            Ok(revised) => self.emit_changed(&line, revised),
            Err(KraError::InvalidIndexedValue(value)) => {
                warn!(
                    field = field.attribute(),
                    record_type = %self.record_type,
                    value = %value,
                    "malformed indexed value, copying unchanged"
                );
                self.report.fields_skipped += 1;
                self.emit(vec![line])
            }
            Err(e) => Err(e),
        }
    }

    fn date_of_modify(&mut self, line: String) -> Result<()> {
        if !self.enabled(FieldKind::DateOfModify) {
            return self.emit(vec![line]);
        }
        let revised = format!(
            "{} {}",
            FieldKind::DateOfModify.attribute(),
            self.options.date_of_modify
        );
        self.emit_changed(&line, revised)
    }

    fn dn(&mut self, line: String) -> Result<()> {
        if !self.enabled(FieldKind::Dn) {
            return self.emit(vec![line]);
        }

        let mut revised = if line.starts_with(DN_EMBEDDED_CN) {
            let (cn, rest) = match line.split_once(',') {
                Some((cn, rest)) => (cn, Some(rest)),
                None => (line.as_str(), None),
            };
            let cn = compose_numeric_line(
                DN_EMBEDDED_CN,
                "=",
                cn,
                false,
                self.options.id_offset.as_ref(),
            )?;
            match rest {
                Some(rest) => format!("{},{}", cn, rest),
                None => cn,
            }
        } else {
            line.clone()
        };

        let options = self.options;
        if let Some(rename) = &options.naming_context {
            revised = rename.apply(&revised);
        }
        self.emit_changed(&line, revised)
    }

    fn request_notes(&mut self, line: String, cursor: &mut LineCursor) -> Result<()> {
        let continued = cursor.take_continuation_lines();
        if !self.enabled(FieldKind::ExtdataRequestNotes) {
            let mut lines = vec![line];
            lines.extend(continued);
            return self.emit(lines);
        }

        let attribute = FieldKind::ExtdataRequestNotes.attribute();
        let mut existing = line.get(attribute.len()..).unwrap_or("").trim().to_string();
        for part in &continued {
            let part = part.strip_prefix(' ').unwrap_or(part);
            existing.push_str(&part.replace('\r', ""));
        }

        let revised = fold_ldif(NOTES_FIRST_LINE_LEN, &append_note(&existing, self.note));
        debug!(record_type = %self.record_type, "appended audit note");
        self.report.notes_appended += 1;
        self.emit(notes_lines(&revised))
    }

    fn request_type(&mut self, line: String) -> Result<()> {
        let notes_attribute = FieldKind::ExtdataRequestNotes.attribute();
        let has_notes = self
            .previous
            .as_deref()
            .map_or(false, |previous| previous.starts_with(notes_attribute));

        if fields::synthesizes_notes(self.record_type)
            && !has_notes
            && self
                .options
                .field_policy
                .is_enabled(self.record_type, FieldKind::ExtdataRequestNotes)
        {
            let folded = fold_ldif(NOTES_FIRST_LINE_LEN, self.note);
            debug!(record_type = %self.record_type, "created missing request notes");
            self.report.notes_synthesized += 1;
            self.emit(notes_lines(&folded))?;
        }
        self.emit(vec![line])
    }

    fn private_key_data(&mut self, line: String, cursor: &mut LineCursor) -> Result<()> {
        let options = self.options;
        let rewrap = match &options.rewrap {
            Some(rewrap) if self.enabled(FieldKind::PrivateKeyData) => rewrap,
            _ => return self.emit(vec![line]),
        };

        let attribute = FieldKind::PrivateKeyData.attribute();
        let mut encoded = line.get(attribute.len()..).unwrap_or("").trim().to_string();
        for part in cursor.take_continuation_lines() {
            encoded.push_str(part.trim());
        }

        let source = BASE64.decode(encoded.as_bytes())?;
        let target = rewrap.rewrap_blob(&source)?;
        let folded = fold_ldif(PRIVATE_KEY_DATA_FIRST_LINE_LEN, &BASE64.encode(target));

        debug!(record_type = %self.record_type, "rewrapped privateKeyData");
        self.report.keys_rewrapped += 1;
        self.report.fields_changed += 1;

        let mut lines = folded.split('\n').map(str::to_string);
        let first = lines.next().unwrap_or_default();
        let mut output = vec![format!("{} {}", attribute, first)];
        output.extend(lines);
        self.emit(output)
    }

    fn follows_auth_token(&self) -> bool {
        self.previous.as_deref().map_or(false, |previous| {
            previous.starts_with(AUTH_TOKEN_USER) || previous.starts_with(AUTH_TOKEN_USER_DN)
        })
    }

    /// Line following an enrollment's authenticated user attribute
    fn auth_token_value(&mut self, line: String) -> Result<()> {
        if self.record_type != RecordType::Enrollment {
            warn!(record_type = %self.record_type, "mismatched authentication token field, copying unchanged");
            self.report.fields_mismatched += 1;
            return self.emit(vec![line]);
        }
        let options = self.options;
        match &options.naming_context {
            Some(rename) => {
                let revised = rename.apply(&line);
                self.emit_changed(&line, revised)
            }
            None => self.emit(vec![line]),
        }
    }
}

/// `extdata-requestnotes:` lines for a folded notes value
fn notes_lines(folded: &str) -> Vec<String> {
    let attribute = FieldKind::ExtdataRequestNotes.attribute();
    let mut lines = folded.split('\n').map(str::to_string);
    let first = lines.next().unwrap_or_default();
    let mut output = vec![format!("{} {}", attribute, first)];
    output.extend(lines);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rsa::BigUint;
    use std::io::Cursor;

    fn options_with_offset(offset: IdOffset) -> TransformOptions {
        TransformOptions {
            id_offset: Some(offset),
            date_of_modify: "20261018120000Z".to_string(),
            ..TransformOptions::default()
        }
    }

    fn run(input: &str, options: &TransformOptions) -> (String, TransformReport) {
        let mut output = Vec::new();
        let report = transform(Cursor::new(input), &mut output, options).unwrap();
        (String::from_utf8(output).unwrap(), report)
    }

    #[test]
    fn test_requires_rewrap_or_offset() {
        let options = TransformOptions::default();
        let result = transform(Cursor::new(""), Vec::new(), &options);
        assert!(matches!(result, Err(KraError::InvalidConfig(_))));
    }

    #[test]
    fn test_enrollment_request_offset() {
        let input = "\
dn: cn=273,ou=kra,ou=requests,o=pki-kra
cn: 273
dateOfModify: 20200101000000Z
extdata-keyrecord: 41
extdata-requestid: 273
requestId: 03273
requestType: enrollment

";
        let options = options_with_offset(IdOffset::append(BigUint::from(100_000_000_000u64)));
        let (output, report) = run(input, &options);

        let expected = "\
dn: cn=100000000273,ou=kra,ou=requests,o=pki-kra
cn: 100000000273
dateOfModify: 20261018120000Z
extdata-keyrecord: 100000000041
extdata-requestid: 273
requestId: 12100000000273
requestType: enrollment

";
        assert_eq!(output, expected);
        assert_eq!(report.records_read, 1);
        assert_eq!(report.fields_changed, 5);
        assert!(report.completed);
    }

    #[test]
    fn test_notes_appended_and_folded() {
        let input = "\
dn: cn=5,ou=kra,ou=requests,o=pki-kra
extdata-requestnotes: archived by
  the agent
requestType: recovery

";
        let options = options_with_offset(IdOffset::remove(BigUint::from(2u32)));
        let (output, report) = run(input, &options);

        let note = "archived by the agent [20261018120000Z]: REMOVED ID offset '2'";
        let folded = fold_ldif(56, note);
        let expected = format!(
            "dn: cn=3,ou=kra,ou=requests,o=pki-kra\nextdata-requestnotes: {}\nrequestType: recovery\n\n",
            folded
        );
        assert_eq!(output, expected);
        assert_eq!(report.notes_appended, 1);
    }

    #[test]
    fn test_missing_notes_synthesized() {
        let input = "\
dn: cn=9,ou=kra,ou=requests,o=pki-kra
extdata-requesttype: netkeyKeygen
requestType: netkeyKeygen

";
        let options = options_with_offset(IdOffset::append(BigUint::from(100u32)));
        let (output, report) = run(input, &options);

        assert_eq!(
            output,
            "dn: cn=109,ou=kra,ou=requests,o=pki-kra\n\
             extdata-requestnotes: [20261018120000Z]: APPENDED ID offset '100'\n\
             extdata-requesttype: netkeyKeygen\n\
             requestType: netkeyKeygen\n\n"
        );
        assert_eq!(report.notes_synthesized, 1);
    }

    #[test]
    fn test_generic_records_and_requests_only() {
        let input = "\
version: 1

dn: ou=kra,o=pki-kra
cn: 77
serialno: 0277

dn: cn=1,ou=keyRepository,ou=kra,o=pki-kra
serialno: 011
archivedBy: CA-pki.example.com

";
        let mut options = options_with_offset(IdOffset::append(BigUint::from(1000u32)));
        let (output, _) = run(input, &options);
        assert!(output.contains("cn: 77\nserialno: 0277\n"));
        assert!(output.contains("serialno: 041001\n"));

        options.requests_and_keys_only = true;
        let (output, report) = run(input, &options);
        assert_eq!(
            output,
            "dn: cn=1001,ou=keyRepository,ou=kra,o=pki-kra\nserialno: 041001\narchivedBy: CA-pki.example.com\n\n"
        );
        assert_eq!(report.records_dropped, 2);
        assert_eq!(report.records_written, 1);
    }

    #[test]
    fn test_naming_context_rename() {
        let input = "\
dn: cn=1,ou=kra,ou=requests,o=kra-old
extdata-auth--005ftoken;user:
 uid=admin,o=kra-old
requestType: enrollment

";
        let mut options = options_with_offset(IdOffset::append(BigUint::from(10u32)));
        options.naming_context = Some(NamingContextRewrite::new("o=kra-old", "o=kra-new"));
        let (output, _) = run(input, &options);

        assert_eq!(
            output,
            "dn: cn=11,ou=kra,ou=requests,o=kra-new\n\
             extdata-auth--005ftoken;user:\n \
             uid=admin,o=kra-new\n\
             requestType: enrollment\n\n"
        );
    }

    #[test]
    fn test_disabled_fields_pass_through() {
        let input = "cn: 5\nrequestId: 015\nrequestType: recovery\n\n";
        let mut options = options_with_offset(IdOffset::append(BigUint::from(10u32)));
        options.field_policy = FieldPolicy::parse("kratool.ldif.recoveryRequest.cn=true\n");
        let (output, report) = run(input, &options);
        assert_eq!(output, "cn: 15\nrequestId: 015\nrequestType: recovery\n\n");
        assert_eq!(report.fields_changed, 1);
    }

    #[test]
    fn test_offset_violation_aborts() {
        let input = "cn: 500\nrequestType: recovery\n\n";
        let options = options_with_offset(IdOffset::append(BigUint::from(100u32)));
        let result = transform(Cursor::new(input), Vec::new(), &options);
        assert!(matches!(result, Err(KraError::OffsetPolicyViolation { .. })));
    }

    #[test]
    fn test_malformed_indexed_value_copied() {
        let input = "dn: cn=73,ou=ca,ou=requests,o=kra\n\
                     requestId: 0373\n\
                     requestType: recovery\n\
                     cn: 73\n\n\
                     dn: cn=74,ou=ca,ou=requests,o=kra\n\
                     requestId: 5\n\
                     requestType: recovery\n\
                     cn: 74\n";
        let options = options_with_offset(IdOffset::append(BigUint::from(100_000_000_000u64)));
        let (output, report) = run(input, &options);

        assert!(report.completed);
        assert_eq!(report.records_written, 2);
        assert_eq!(report.fields_skipped, 2);
        assert!(output.contains("\nrequestId: 0373\n"));
        assert!(output.contains("\nrequestId: 5\n"));
        assert!(output.contains("cn: 100000000073\n"));
        assert!(output.contains("cn: 100000000074\n"));
    }

    #[test]
    fn test_indexed_overflow_aborts() {
        let input = format!("requestId: 991{}\nrequestType: recovery\n", "0".repeat(98));
        let offset = BigUint::parse_bytes("9".repeat(99).as_bytes(), 10).unwrap();
        let result = transform(
            Cursor::new(input),
            Vec::new(),
            &options_with_offset(IdOffset::append(offset)),
        );
        assert!(matches!(result, Err(KraError::IndexedOverflow { .. })));
    }

    #[test]
    fn test_cancelled_run_is_incomplete() {
        let cancel = Arc::new(AtomicBool::new(true));
        let mut options = options_with_offset(IdOffset::append(BigUint::from(100u32)));
        options.cancel = Some(cancel);
        let (output, report) = run("cn: 1\nrequestType: recovery\n\n", &options);
        assert!(output.is_empty());
        assert!(!report.completed);
    }
}
