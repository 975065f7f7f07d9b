use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Display length of a derived prompt title, in characters, before the ellipsis.
pub const TITLE_MAX_CHARS: usize = 50;
pub const TITLE_ELLIPSIS: &str = "...";

/// Fixed-width UTC layout shared with `strftime('%Y-%m-%dT%H:%M:%fZ')` so stored
/// timestamps order lexicographically.
const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ValidationError {
    #[error("content MUST contain non-whitespace text")]
    EmptyContent,
    #[error("malformed input: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Invariant {
    VersionContinuity,
    MethodologyBinding,
    LineageIdentity,
    VersionUniqueness,
}

impl Invariant {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VersionContinuity => "version_continuity",
            Self::MethodologyBinding => "methodology_binding",
            Self::LineageIdentity => "lineage_identity",
            Self::VersionUniqueness => "version_uniqueness",
        }
    }
}

impl Display for Invariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("invariant `{invariant}` violated: {detail}")]
pub struct InvariantViolation {
    pub invariant: Invariant,
    pub detail: String,
}

impl InvariantViolation {
    #[must_use]
    pub fn new(invariant: Invariant, detail: impl Into<String>) -> Self {
        Self { invariant, detail: detail.into() }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TransformError {
    #[error("transform failed: {0}")]
    Failed(String),
    #[error("transform was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CipherError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PromptId(pub i64);

impl Display for PromptId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct MethodologyId(pub i64);

impl Display for MethodologyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MethodologyKind {
    Intent,
    Technique,
    Evasion,
}

impl MethodologyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Technique => "technique",
            Self::Evasion => "evasion",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "intent" => Some(Self::Intent),
            "technique" => Some(Self::Technique),
            "evasion" => Some(Self::Evasion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Initial,
    ManualEdit,
    MethodologyApply,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::ManualEdit => "manual_edit",
            Self::MethodologyApply => "methodology_apply",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initial" => Some(Self::Initial),
            "manual_edit" => Some(Self::ManualEdit),
            "methodology_apply" => Some(Self::MethodologyApply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MethodologyRecord {
    pub id: MethodologyId,
    pub name: String,
    pub description: String,
    pub path: String,
    pub kind: MethodologyKind,
    pub examples: Value,
    pub prompt_samples: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMethodology {
    pub name: String,
    pub description: String,
    pub path: String,
    pub kind: MethodologyKind,
    #[serde(default)]
    pub examples: Value,
    #[serde(default)]
    pub prompt_samples: Value,
}

impl NewMethodology {
    /// # Errors
    /// Returns [`ValidationError::Malformed`] when the name is blank or the
    /// taxonomy path has an empty segment.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Malformed("methodology name MUST be non-empty".to_string()));
        }
        if self.path.split('.').any(|segment| segment.trim().is_empty()) {
            return Err(ValidationError::Malformed(format!(
                "methodology path MUST be a dotted path without empty segments: {:?}",
                self.path
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptRecord {
    pub id: PromptId,
    pub title: Option<String>,
    pub content: String,
    pub parent_id: Option<PromptId>,
    pub methodology_id: Option<MethodologyId>,
    pub change_kind: ChangeKind,
    pub version_number: u32,
    pub lineage_root_id: Option<PromptId>,
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PromptRecord {
    /// Lineage a child of this record joins: the resolved root, or the record
    /// itself when no root has been resolved yet.
    #[must_use]
    pub fn effective_lineage_root(&self) -> PromptId {
        self.lineage_root_id.unwrap_or(self.id)
    }
}

/// Candidate prompt row before the store assigns its id.
///
/// `lineage_root_id` stays `None` for [`ChangeKind::Initial`]; the store
/// resolves it to the assigned id inside the insert transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPrompt {
    pub title: Option<String>,
    pub content: String,
    pub parent_id: Option<PromptId>,
    pub methodology_id: Option<MethodologyId>,
    pub change_kind: ChangeKind,
    pub version_number: u32,
    pub lineage_root_id: Option<PromptId>,
    pub metadata: Value,
}

impl NewPrompt {
    #[must_use]
    pub fn initial(content: &str) -> Self {
        Self {
            title: derive_title(content),
            content: content.to_string(),
            parent_id: None,
            methodology_id: None,
            change_kind: ChangeKind::Initial,
            version_number: 1,
            lineage_root_id: None,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub fn child_of(parent: &PromptRecord, content: &str, change_kind: ChangeKind) -> Self {
        Self {
            title: derive_title(content),
            content: content.to_string(),
            parent_id: Some(parent.id),
            methodology_id: None,
            change_kind,
            version_number: parent.version_number.saturating_add(1),
            lineage_root_id: Some(parent.effective_lineage_root()),
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub fn with_methodology(mut self, methodology_id: MethodologyId) -> Self {
        self.methodology_id = Some(methodology_id);
        self
    }

    /// Input-shape checks that run before any write is attempted.
    ///
    /// # Errors
    /// Returns [`ValidationError::EmptyContent`] for blank content and
    /// [`ValidationError::Malformed`] for a zero version or non-object metadata.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        if self.version_number == 0 {
            return Err(ValidationError::Malformed("version_number MUST be >= 1".to_string()));
        }
        if !self.metadata.is_object() {
            return Err(ValidationError::Malformed(
                "metadata MUST be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

/// Check the lineage rules that do not need the rest of the store.
///
/// `parent` is the record the store found for `candidate.parent_id`, if any.
/// Version-slot uniqueness needs a store lookup and is checked by the caller.
///
/// # Errors
/// Returns the first [`InvariantViolation`] found, naming the broken rule.
pub fn check_invariants(
    candidate: &NewPrompt,
    parent: Option<&PromptRecord>,
) -> Result<(), InvariantViolation> {
    let needs_methodology = candidate.change_kind == ChangeKind::MethodologyApply;
    if needs_methodology != candidate.methodology_id.is_some() {
        return Err(InvariantViolation::new(
            Invariant::MethodologyBinding,
            format!(
                "methodology_id MUST be {} for change_kind {}",
                if needs_methodology { "set" } else { "null" },
                candidate.change_kind.as_str()
            ),
        ));
    }

    if candidate.change_kind == ChangeKind::Initial {
        if candidate.version_number != 1 {
            return Err(InvariantViolation::new(
                Invariant::VersionContinuity,
                format!("initial record MUST be version 1, got {}", candidate.version_number),
            ));
        }
        if let Some(parent_id) = candidate.parent_id {
            return Err(InvariantViolation::new(
                Invariant::VersionContinuity,
                format!("initial record MUST NOT have a parent (got {parent_id})"),
            ));
        }
        if let Some(root) = candidate.lineage_root_id {
            return Err(InvariantViolation::new(
                Invariant::LineageIdentity,
                format!("initial record MUST reference itself as lineage root, not {root}"),
            ));
        }
        return Ok(());
    }

    let Some(parent_id) = candidate.parent_id else {
        return Err(InvariantViolation::new(
            Invariant::VersionContinuity,
            format!("{} record MUST reference a parent", candidate.change_kind.as_str()),
        ));
    };
    let Some(parent) = parent.filter(|parent| parent.id == parent_id) else {
        return Err(InvariantViolation::new(
            Invariant::VersionContinuity,
            format!("parent {parent_id} does not exist"),
        ));
    };

    let expected_version = parent.version_number.saturating_add(1);
    if candidate.version_number != expected_version {
        return Err(InvariantViolation::new(
            Invariant::VersionContinuity,
            format!(
                "version_number MUST be {expected_version} (parent {} is version {}), got {}",
                parent.id, parent.version_number, candidate.version_number
            ),
        ));
    }

    let expected_root = parent.effective_lineage_root();
    if candidate.lineage_root_id != Some(expected_root) {
        return Err(InvariantViolation::new(
            Invariant::LineageIdentity,
            format!(
                "lineage_root_id MUST be {expected_root} (inherited from parent {}), got {}",
                parent.id,
                candidate.lineage_root_id.map_or_else(|| "null".to_string(), |id| id.to_string())
            ),
        ));
    }

    Ok(())
}

/// First non-blank line of `content`, truncated to [`TITLE_MAX_CHARS`]
/// characters with [`TITLE_ELLIPSIS`] appended when cut.
#[must_use]
pub fn derive_title(content: &str) -> Option<String> {
    let first_line = content.trim().lines().next()?.trim();
    if first_line.is_empty() {
        return None;
    }

    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return Some(first_line.to_string());
    }

    let mut title = first_line.chars().take(TITLE_MAX_CHARS).collect::<String>();
    title.push_str(TITLE_ELLIPSIS);
    Some(title)
}

/// Produces the final text for a methodology application.
///
/// Implementations may report partial output through `progress`; only the
/// returned value is persisted.
pub trait Transform {
    /// # Errors
    /// Returns [`TransformError`] when the transformation fails or is cancelled.
    fn transform(
        &mut self,
        content: &str,
        methodology: &MethodologyRecord,
        progress: &mut dyn FnMut(&str),
    ) -> Result<String, TransformError>;
}

impl<F> Transform for F
where
    F: FnMut(&str, &MethodologyRecord, &mut dyn FnMut(&str)) -> Result<String, TransformError>,
{
    fn transform(
        &mut self,
        content: &str,
        methodology: &MethodologyRecord,
        progress: &mut dyn FnMut(&str),
    ) -> Result<String, TransformError> {
        self(content, methodology, progress)
    }
}

/// Seals provider credentials under a passphrase. The store only ever holds
/// the ciphertext this produces.
pub trait CredentialCipher {
    /// # Errors
    /// Returns [`CipherError`] when key derivation or sealing fails.
    fn encrypt(&self, plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>, CipherError>;

    /// # Errors
    /// Returns [`CipherError`] when the passphrase is wrong or the payload is corrupt.
    fn decrypt(&self, ciphertext: &[u8], passphrase: &str) -> Result<Vec<u8>, CipherError>;
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// # Errors
/// Returns an error when the timestamp cannot be rendered.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, time::error::Format> {
    value.to_offset(UtcOffset::UTC).format(TIMESTAMP_FORMAT)
}

/// # Errors
/// Returns an error when `value` is not in the store's timestamp layout.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    PrimitiveDateTime::parse(value, TIMESTAMP_FORMAT).map(PrimitiveDateTime::assume_utc)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_710_000_000).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    fn stored(id: i64, version: u32, root: Option<i64>) -> PromptRecord {
        PromptRecord {
            id: PromptId(id),
            title: derive_title("fixture"),
            content: "fixture".to_string(),
            parent_id: None,
            methodology_id: None,
            change_kind: if version == 1 { ChangeKind::Initial } else { ChangeKind::ManualEdit },
            version_number: version,
            lineage_root_id: root.map(PromptId),
            metadata: Value::Object(serde_json::Map::new()),
            created_at: fixture_time(),
            updated_at: fixture_time(),
        }
    }

    fn assert_violation(result: Result<(), InvariantViolation>, expected: Invariant) {
        match result {
            Err(violation) => assert_eq!(violation.invariant, expected, "{violation}"),
            Ok(()) => panic!("expected {expected} violation"),
        }
    }

    #[test]
    fn title_is_first_line_of_trimmed_content() {
        assert_eq!(
            derive_title("\n  Ignore prior instructions\nsecond line"),
            Some("Ignore prior instructions".to_string())
        );
        assert_eq!(derive_title("   \n\t"), None);
    }

    #[test]
    fn long_title_is_truncated_with_ellipsis() {
        let content = "x".repeat(TITLE_MAX_CHARS + 10);
        let title = derive_title(&content).unwrap_or_default();
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + TITLE_ELLIPSIS.len());
        assert!(title.ends_with(TITLE_ELLIPSIS));

        let exact = "y".repeat(TITLE_MAX_CHARS);
        assert_eq!(derive_title(&exact), Some(exact.clone()));
    }

    #[test]
    fn title_truncation_counts_characters_not_bytes() {
        let content = "é".repeat(TITLE_MAX_CHARS + 1);
        let title = derive_title(&content).unwrap_or_default();
        assert!(title.starts_with(&"é".repeat(TITLE_MAX_CHARS)));
        assert!(title.ends_with(TITLE_ELLIPSIS));
    }

    #[test]
    fn validate_rejects_whitespace_only_content() {
        let candidate = NewPrompt::initial(" \n\t ");
        assert_eq!(candidate.validate(), Err(ValidationError::EmptyContent));
    }

    #[test]
    fn validate_rejects_non_object_metadata() {
        let mut candidate = NewPrompt::initial("hello");
        candidate.metadata = Value::Array(vec![]);
        assert!(matches!(candidate.validate(), Err(ValidationError::Malformed(_))));
    }

    #[test]
    fn initial_candidate_passes_invariants() {
        assert_eq!(check_invariants(&NewPrompt::initial("hello"), None), Ok(()));
    }

    #[test]
    fn initial_with_version_other_than_one_breaks_continuity() {
        let mut candidate = NewPrompt::initial("hello");
        candidate.version_number = 2;
        assert_violation(check_invariants(&candidate, None), Invariant::VersionContinuity);
    }

    #[test]
    fn initial_with_preset_root_breaks_lineage_identity() {
        let mut candidate = NewPrompt::initial("hello");
        candidate.lineage_root_id = Some(PromptId(9));
        assert_violation(check_invariants(&candidate, None), Invariant::LineageIdentity);
    }

    #[test]
    fn child_of_parent_passes_invariants() {
        let parent = stored(4, 3, Some(1));
        let candidate = NewPrompt::child_of(&parent, "edit", ChangeKind::ManualEdit);
        assert_eq!(candidate.version_number, 4);
        assert_eq!(candidate.lineage_root_id, Some(PromptId(1)));
        assert_eq!(check_invariants(&candidate, Some(&parent)), Ok(()));
    }

    #[test]
    fn child_inherits_parent_id_when_parent_root_is_unresolved() {
        let parent = stored(7, 1, None);
        let candidate = NewPrompt::child_of(&parent, "edit", ChangeKind::ManualEdit);
        assert_eq!(candidate.lineage_root_id, Some(PromptId(7)));
        assert_eq!(check_invariants(&candidate, Some(&parent)), Ok(()));
    }

    #[test]
    fn child_with_skipped_version_breaks_continuity() {
        let parent = stored(4, 3, Some(1));
        let mut candidate = NewPrompt::child_of(&parent, "edit", ChangeKind::ManualEdit);
        candidate.version_number = 6;
        assert_violation(check_invariants(&candidate, Some(&parent)), Invariant::VersionContinuity);
    }

    #[test]
    fn child_without_parent_breaks_continuity() {
        let parent = stored(4, 3, Some(1));
        let mut candidate = NewPrompt::child_of(&parent, "edit", ChangeKind::ManualEdit);
        candidate.parent_id = None;
        assert_violation(check_invariants(&candidate, None), Invariant::VersionContinuity);

        let candidate = NewPrompt::child_of(&parent, "edit", ChangeKind::ManualEdit);
        assert_violation(check_invariants(&candidate, None), Invariant::VersionContinuity);
    }

    #[test]
    fn child_in_foreign_lineage_breaks_identity() {
        let parent = stored(4, 3, Some(1));
        let mut candidate = NewPrompt::child_of(&parent, "edit", ChangeKind::ManualEdit);
        candidate.lineage_root_id = Some(PromptId(2));
        assert_violation(check_invariants(&candidate, Some(&parent)), Invariant::LineageIdentity);
    }

    #[test]
    fn methodology_binding_is_required_iff_methodology_apply() {
        let parent = stored(4, 3, Some(1));

        let missing = NewPrompt::child_of(&parent, "edit", ChangeKind::MethodologyApply);
        assert_violation(check_invariants(&missing, Some(&parent)), Invariant::MethodologyBinding);

        let bound = NewPrompt::child_of(&parent, "edit", ChangeKind::MethodologyApply)
            .with_methodology(MethodologyId(3));
        assert_eq!(check_invariants(&bound, Some(&parent)), Ok(()));

        let stray = NewPrompt::child_of(&parent, "edit", ChangeKind::ManualEdit)
            .with_methodology(MethodologyId(3));
        assert_violation(check_invariants(&stray, Some(&parent)), Invariant::MethodologyBinding);

        let stray_initial = NewPrompt::initial("hello").with_methodology(MethodologyId(3));
        assert_violation(check_invariants(&stray_initial, None), Invariant::MethodologyBinding);
    }

    #[test]
    fn new_methodology_validation_rejects_blank_name_and_empty_path_segment() {
        let mut methodology = NewMethodology {
            name: "role_play".to_string(),
            description: "desc".to_string(),
            path: "technique.framing.role_play".to_string(),
            kind: MethodologyKind::Technique,
            examples: Value::Null,
            prompt_samples: Value::Null,
        };
        assert_eq!(methodology.validate(), Ok(()));

        methodology.path = "technique..role_play".to_string();
        assert!(methodology.validate().is_err());

        methodology.path = "technique".to_string();
        methodology.name = "  ".to_string();
        assert!(methodology.validate().is_err());
    }

    #[test]
    fn timestamps_round_trip_at_millisecond_precision() {
        let value = fixture_time() + time::Duration::milliseconds(250);
        let formatted = format_timestamp(value).unwrap_or_default();
        assert_eq!(formatted, "2024-03-09T16:00:00.250Z");
        assert_eq!(parse_timestamp(&formatted).ok(), Some(value));
    }

    #[test]
    fn enum_string_forms_round_trip() {
        for kind in [ChangeKind::Initial, ChangeKind::ManualEdit, ChangeKind::MethodologyApply] {
            assert_eq!(ChangeKind::parse(kind.as_str()), Some(kind));
        }
        for kind in [MethodologyKind::Intent, MethodologyKind::Technique, MethodologyKind::Evasion] {
            assert_eq!(MethodologyKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChangeKind::parse("manualEdit"), None);
    }

    proptest! {
        #[test]
        fn property_title_never_exceeds_display_length(content in "\\PC{1,200}") {
            if let Some(title) = derive_title(&content) {
                prop_assert!(title.chars().count() <= TITLE_MAX_CHARS + TITLE_ELLIPSIS.len());
                prop_assert!(!title.contains('\n'));
            }
        }

        #[test]
        fn property_child_of_always_satisfies_invariants(
            parent_id in 1_i64..10_000,
            root in proptest::option::of(1_i64..10_000),
            version in 1_u32..1_000,
        ) {
            let parent = stored(parent_id, version, root);
            let candidate = NewPrompt::child_of(&parent, "edit", ChangeKind::ManualEdit);
            prop_assert_eq!(check_invariants(&candidate, Some(&parent)), Ok(()));
        }
    }
}
