use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{ContractId, Finding};

const FIELD_SEPARATOR: u8 = 0x1f;
const SHORT_LEN: usize = 12;

/// Deterministic dedupe key for a finding: SHA-256 over the contract
/// identifier, the normalized vulnerability kind and the description hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(finding: &Finding) -> Self {
        Self::from_parts(
            &finding.contract,
            &finding.vulnerability_kind,
            &finding.description,
        )
    }

    pub fn from_parts(contract: &ContractId, vulnerability_kind: &str, description: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(contract.to_string().as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(normalize_kind(vulnerability_kind).as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(description_hash(description).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Rebuild a fingerprint read back from storage.
    pub(crate) fn from_stored(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs and terminal output.
    pub fn short(&self) -> &str {
        &self.0[..SHORT_LEN.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-case, collapse whitespace runs and trim.
pub fn normalize_description(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// `Flash_Loan`, `flash-loan` and `flash loan` all normalize to `flash loan`.
pub fn normalize_kind(kind: &str) -> String {
    normalize_description(&kind.replace(['_', '-'], " "))
}

pub fn description_hash(description: &str) -> String {
    hex::encode(Sha256::digest(normalize_description(description).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn finding(confidence: f64, description: &str) -> Finding {
        Finding::new(
            ContractId::new("ethereum", "0xABCD").unwrap(),
            "Reentrancy",
            confidence,
            "session-1",
            description,
        )
        .unwrap()
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = Fingerprint::of(&finding(0.85, "withdraw() updates state late"));
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp.short().len(), 12);
    }

    #[test]
    fn normalization_ignores_case_and_spacing() {
        assert_eq!(
            normalize_description("  Withdraw()\n updates   STATE late "),
            "withdraw() updates state late"
        );
        assert_eq!(normalize_kind("Flash_Loan"), "flash loan");
        assert_eq!(normalize_kind("flash-loan"), "flash loan");
        assert_eq!(
            Fingerprint::of(&finding(0.85, "Withdraw  updates state")),
            Fingerprint::of(&finding(0.85, "withdraw updates STATE"))
        );
    }

    #[test]
    fn session_does_not_affect_fingerprint() {
        let first = finding(0.85, "desc");
        let mut second = first.clone();
        second.session_id = "session-2".into();
        assert_eq!(Fingerprint::of(&first), Fingerprint::of(&second));
    }

    #[test]
    fn identifying_fields_change_fingerprint() {
        let base = finding(0.85, "desc");
        let mut other_kind = base.clone();
        other_kind.vulnerability_kind = "access control".into();
        let mut other_contract = base.clone();
        other_contract.contract = ContractId::new("base", "0xabcd").unwrap();
        assert_ne!(Fingerprint::of(&base), Fingerprint::of(&other_kind));
        assert_ne!(Fingerprint::of(&base), Fingerprint::of(&other_contract));
        assert_ne!(Fingerprint::of(&base), Fingerprint::of(&finding(0.85, "other")));
    }

    proptest! {
        #[test]
        fn confidence_never_changes_fingerprint(
            a in 0.0f64..=1.0,
            b in 0.0f64..=1.0,
            description in "[A-Za-z0-9 ]{0,64}",
        ) {
            let first = finding(a, &description);
            let second = finding(b, &description);
            prop_assert_eq!(Fingerprint::of(&first), Fingerprint::of(&second));
            prop_assert_eq!(Fingerprint::of(&first), Fingerprint::of(&first.clone()));
        }
    }
}
