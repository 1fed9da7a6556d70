//! Audit notes and LDIF line folding

use super::offset::{IdOffset, OffsetMode};
use super::NamingContextRewrite;

/// First-line data length of a folded `extdata-requestnotes:` value
pub const NOTES_FIRST_LINE_LEN: usize = 56;

/// First-line data length of a folded `privateKeyData::` value
pub const PRIVATE_KEY_DATA_FIRST_LINE_LEN: usize = 60;

/// Data length of every continuation line
pub const CONTINUATION_LINE_LEN: usize = 76;

/// Fold `data` into LDIF lines
///
/// The first line carries `first_line_len` characters; each following line
/// is a single space plus up to 76 characters. Trailing whitespace is
/// removed. Data that fits on the first line is returned unchanged.
pub fn fold_ldif(first_line_len: usize, data: &str) -> String {
    let chars: Vec<char> = data.chars().collect();
    if chars.len() <= first_line_len {
        return data.trim_end().to_string();
    }

    let mut folded: String = chars[..first_line_len].iter().collect();
    for chunk in chars[first_line_len..].chunks(CONTINUATION_LINE_LEN) {
        folded.push_str("\n ");
        folded.extend(chunk);
    }
    folded.trim_end().to_string()
}

/// Text appended to request notes describing what this run changed
#[derive(Debug, Clone, Default)]
pub struct AuditNote<'a> {
    pub date: &'a str,
    /// Modulus size of the target storage key when rewrapping
    pub rewrap_bits: Option<usize>,
    pub used_password_file: bool,
    pub id_offset: Option<&'a IdOffset>,
    pub naming_context: Option<&'a NamingContextRewrite>,
    pub requests_and_keys_only: bool,
}

impl AuditNote<'_> {
    /// `[<date>]: ` followed by one clause per change
    pub fn render(&self) -> String {
        let mut note = format!("[{}]: ", self.date);

        if let Some(bits) = self.rewrap_bits {
            note.push_str(&format!(
                "REWRAPPED the 'existing symmetric session key' with the '{}-bit RSA public key' obtained from the target storage certificate",
                bits
            ));
            if self.used_password_file {
                note.push_str(" + USED source PKI security database password file");
            }
        }

        if let Some(id_offset) = self.id_offset {
            if self.rewrap_bits.is_some() {
                note.push_str(" + ");
            }
            let verb = match id_offset.mode {
                OffsetMode::Append => "APPENDED",
                OffsetMode::Remove => "REMOVED",
            };
            note.push_str(&format!("{} ID offset '{}'", verb, id_offset.offset));
        }

        if let Some(rename) = self.naming_context {
            note.push_str(&format!(
                " + RENAMED source KRA naming context '{}' to target KRA naming context '{}'",
                rename.source, rename.target
            ));
        }

        if self.requests_and_keys_only {
            note.push_str(" + PROCESSED requests and key records ONLY");
        }

        note
    }
}

/// Append `note` to an existing notes value
pub fn append_note(existing: &str, note: &str) -> String {
    if existing.is_empty() {
        note.to_string()
    } else {
        format!("{} {}", existing, note)
    }
}
