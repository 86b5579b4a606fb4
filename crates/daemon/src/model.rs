//! Data model for tracked files and conversion groups.
//!
//! A `FileEntry` is the unit of bookkeeping for one path on disk; a
//! `GroupEntry` ties an original file to its stereo companion. Status enums
//! carry their own transition legality tables so illegal state changes are
//! rejected before anything is persisted.

use serde::{Deserialize, Serialize};
use std::hash::Hasher as _;
use std::path::{Path, PathBuf};
use twox_hash::XxHash64;

/// Far-future scheduling sentinel for terminal records (9999-12-31T23:59:59Z).
/// Rows scheduled here are excluded from due queries by index predicate.
pub const NEVER_TS: i64 = 253_402_300_799;

/// Integrity verdict history of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    /// Not checked yet.
    Unknown,
    /// A check has been claimed and its outcome not yet recorded.
    Pending,
    /// The file decodes cleanly; its content can be trusted.
    Complete,
    /// The check failed; the file looks truncated or damaged.
    Incomplete,
    /// The check itself errored.
    Error,
}

impl Default for IntegrityStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for IntegrityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IntegrityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityStatus::Unknown => "unknown",
            IntegrityStatus::Pending => "pending",
            IntegrityStatus::Complete => "complete",
            IntegrityStatus::Incomplete => "incomplete",
            IntegrityStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "pending" => Some(Self::Pending),
            "complete" => Some(Self::Complete),
            "incomplete" => Some(Self::Incomplete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether `self -> target` is a legal transition. Staying put is always
    /// legal. A size change re-arms any status back to `Unknown`.
    pub fn can_transition_to(&self, target: IntegrityStatus) -> bool {
        use IntegrityStatus::*;
        if *self == target {
            return true;
        }
        match self {
            Unknown => matches!(target, Pending | Error),
            Pending => matches!(target, Complete | Incomplete | Error | Unknown),
            Complete => matches!(target, Pending | Error | Unknown),
            Incomplete => matches!(target, Pending | Error | Unknown),
            Error => matches!(target, Pending | Unknown),
        }
    }
}

/// Processing lifecycle of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedStatus {
    /// Nothing done yet.
    New,
    /// An English stereo track already exists; no conversion needed.
    SkippedHasEn2,
    /// Stereo companion produced successfully.
    Converted,
    /// Conversion failed; retried until the attempt cap.
    ConvertFailed,
    /// Conversion underway; waiting for the companion to appear.
    GroupPendingPair,
    /// The whole group reached its final shape.
    GroupProcessed,
    /// Excluded from processing (missing file, no usable tracks, retry cap).
    Ignored,
    /// A second path claimed an already-occupied group role.
    Duplicate,
}

impl Default for ProcessedStatus {
    fn default() -> Self {
        Self::New
    }
}

impl std::fmt::Display for ProcessedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProcessedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedStatus::New => "new",
            ProcessedStatus::SkippedHasEn2 => "skipped_has_en2",
            ProcessedStatus::Converted => "converted",
            ProcessedStatus::ConvertFailed => "convert_failed",
            ProcessedStatus::GroupPendingPair => "group_pending_pair",
            ProcessedStatus::GroupProcessed => "group_processed",
            ProcessedStatus::Ignored => "ignored",
            ProcessedStatus::Duplicate => "duplicate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "skipped_has_en2" => Some(Self::SkippedHasEn2),
            "converted" => Some(Self::Converted),
            "convert_failed" => Some(Self::ConvertFailed),
            "group_pending_pair" => Some(Self::GroupPendingPair),
            "group_processed" => Some(Self::GroupProcessed),
            "ignored" => Some(Self::Ignored),
            "duplicate" => Some(Self::Duplicate),
            _ => None,
        }
    }

    /// Statuses that count as a finished member for group completion.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ProcessedStatus::SkippedHasEn2
                | ProcessedStatus::Converted
                | ProcessedStatus::GroupProcessed
                | ProcessedStatus::Ignored
                | ProcessedStatus::Duplicate
        )
    }

    /// Whether `self -> target` is a legal transition. Staying put is always
    /// legal; a size change re-arms any non-final status back to `New`.
    pub fn can_transition_to(&self, target: ProcessedStatus) -> bool {
        use ProcessedStatus::*;
        if *self == target {
            return true;
        }
        match self {
            New => matches!(
                target,
                SkippedHasEn2 | Converted | ConvertFailed | GroupPendingPair | Ignored | Duplicate
            ),
            SkippedHasEn2 => matches!(target, GroupProcessed),
            Converted => matches!(target, GroupProcessed | New),
            ConvertFailed => matches!(target, New | GroupPendingPair | Converted | Ignored),
            GroupPendingPair => matches!(target, Converted | ConvertFailed | GroupProcessed | New),
            GroupProcessed => false,
            Ignored => false,
            Duplicate => false,
        }
    }
}

/// Which side of a conversion pair a file plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    Original,
    StereoCompanion,
}

impl Default for FileRole {
    fn default() -> Self {
        Self::Original
    }
}

impl std::fmt::Display for FileRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FileRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileRole::Original => "original",
            FileRole::StereoCompanion => "stereo_companion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "original" => Some(Self::Original),
            "stereo_companion" => Some(Self::StereoCompanion),
            _ => None,
        }
    }
}

/// Lifecycle of a conversion group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// Group created; members still working through integrity/probe.
    Forming,
    /// Conversion started; companion not finished yet.
    PendingPair,
    /// Completion rule holds; finalization about to run.
    ReadyToFinalize,
    /// Group in its final shape.
    Processed,
    /// Conversion exhausted its retries.
    Failed,
}

impl Default for GroupState {
    fn default() -> Self {
        Self::Forming
    }
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Forming => "forming",
            GroupState::PendingPair => "pending_pair",
            GroupState::ReadyToFinalize => "ready_to_finalize",
            GroupState::Processed => "processed",
            GroupState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "forming" => Some(Self::Forming),
            "pending_pair" => Some(Self::PendingPair),
            "ready_to_finalize" => Some(Self::ReadyToFinalize),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, target: GroupState) -> bool {
        use GroupState::*;
        if *self == target {
            return true;
        }
        match self {
            Forming => matches!(target, PendingPair | ReadyToFinalize | Failed),
            PendingPair => matches!(target, ReadyToFinalize | Failed | Forming),
            ReadyToFinalize => matches!(target, Processed | PendingPair),
            Processed => false,
            Failed => matches!(target, Forming | PendingPair),
        }
    }
}

/// One tracked file on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    /// Row id, filled after the first upsert.
    pub id: Option<i64>,
    /// Absolute path; the primary identity.
    pub path: PathBuf,
    /// Group this file belongs to.
    pub group_id: String,
    /// Role within the group.
    pub role: FileRole,
    /// Last observed size in bytes.
    pub size_bytes: u64,
    /// When `size_bytes` was sampled.
    pub size_observed_at: i64,
    /// Earliest time the size has been observed unchanged; cleared whenever
    /// the size changes.
    pub stable_since: Option<i64>,
    pub integrity: IntegrityStatus,
    /// 0..1 readability share reported by the integrity checker.
    pub integrity_score: Option<f64>,
    /// Integrity checks performed since the last size change.
    pub integrity_attempts: u32,
    pub processed: ProcessedStatus,
    /// Conversion attempts since the last size change.
    pub convert_attempts: u32,
    /// Cached audio-probe outcome: does an English stereo track exist?
    pub has_en2: Option<bool>,
    /// Scheduled next wake; `NEVER_TS` for terminal records.
    pub next_check_at: i64,
    /// Current retry wait after a recoverable failure.
    pub backoff_sec: u64,
    pub discovered_at: i64,
    pub updated_at: i64,
    pub last_error: Option<String>,
}

impl FileEntry {
    /// Fresh entry as discovery creates it: immediately due, everything
    /// unknown.
    pub fn new_discovered(path: &Path, size_bytes: u64, now: i64) -> Self {
        let (group_id, role) = group_key(path);
        Self {
            id: None,
            path: path.to_path_buf(),
            group_id,
            role,
            size_bytes,
            size_observed_at: now,
            stable_since: None,
            integrity: IntegrityStatus::Unknown,
            integrity_score: None,
            integrity_attempts: 0,
            processed: ProcessedStatus::New,
            convert_attempts: 0,
            has_en2: None,
            next_check_at: now,
            backoff_sec: 0,
            discovered_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Whether the record is parked forever.
    pub fn is_terminal(&self) -> bool {
        self.next_check_at >= NEVER_TS
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.next_check_at <= now
    }

    /// Stable for at least `stable_wait_sec`?
    pub fn is_stable(&self, now: i64, stable_wait_sec: u64) -> bool {
        match self.stable_since {
            Some(since) => now - since >= stable_wait_sec as i64,
            None => false,
        }
    }
}

/// One conversion group: the {original, stereo companion} pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupEntry {
    pub group_id: String,
    pub original_path: Option<PathBuf>,
    pub companion_path: Option<PathBuf>,
    pub state: GroupState,
    /// Policy snapshot taken from config when the group was created.
    pub delete_original: bool,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

impl GroupEntry {
    pub fn new(group_id: &str, delete_original: bool, now: i64) -> Self {
        Self {
            group_id: group_id.to_string(),
            original_path: None,
            companion_path: None,
            state: GroupState::Forming,
            delete_original,
            created_at: now,
            finished_at: None,
        }
    }
}

/// Derives the group identity and role from a path.
///
/// The group name is the file stem with a trailing `.stereo` stripped,
/// prefixed with a short seeded hash of the parent directory so equal names
/// in different directories stay distinct. Group ids are persisted, so the
/// hash must be stable across processes. `movie.stereo.mkv` is the
/// companion of `movie.mkv`.
pub fn group_key(path: &Path) -> (String, FileRole) {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    let (name, role) = match stem.strip_suffix(".stereo") {
        Some(base) => (base, FileRole::StereoCompanion),
        None => (stem, FileRole::Original),
    };

    let parent = path.parent().map(|p| p.to_string_lossy().into_owned());
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(parent.unwrap_or_default().as_bytes());
    let tag = hasher.finish() & 0xffff_ffff;

    (format!("{:08x}/{}", tag, name), role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_status_display_round_trip() {
        for status in [
            IntegrityStatus::Unknown,
            IntegrityStatus::Pending,
            IntegrityStatus::Complete,
            IntegrityStatus::Incomplete,
            IntegrityStatus::Error,
        ] {
            assert_eq!(IntegrityStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            ProcessedStatus::New,
            ProcessedStatus::SkippedHasEn2,
            ProcessedStatus::Converted,
            ProcessedStatus::ConvertFailed,
            ProcessedStatus::GroupPendingPair,
            ProcessedStatus::GroupProcessed,
            ProcessedStatus::Ignored,
            ProcessedStatus::Duplicate,
        ] {
            assert_eq!(ProcessedStatus::parse(status.as_str()), Some(status));
        }
        for state in [
            GroupState::Forming,
            GroupState::PendingPair,
            GroupState::ReadyToFinalize,
            GroupState::Processed,
            GroupState::Failed,
        ] {
            assert_eq!(GroupState::parse(state.as_str()), Some(state));
        }
        assert_eq!(IntegrityStatus::parse("bogus"), None);
        assert_eq!(ProcessedStatus::parse("bogus"), None);
    }

    #[test]
    fn test_integrity_transitions() {
        use IntegrityStatus::*;
        assert!(Unknown.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Complete));
        assert!(Pending.can_transition_to(Incomplete));
        assert!(Incomplete.can_transition_to(Pending));
        assert!(Incomplete.can_transition_to(Unknown)); // size change re-arm
        assert!(Error.can_transition_to(Pending));

        assert!(!Unknown.can_transition_to(Complete)); // must pass through Pending
        assert!(!Unknown.can_transition_to(Incomplete));
        assert!(!Complete.can_transition_to(Incomplete));
    }

    #[test]
    fn test_processed_transitions() {
        use ProcessedStatus::*;
        assert!(New.can_transition_to(SkippedHasEn2));
        assert!(New.can_transition_to(GroupPendingPair));
        assert!(New.can_transition_to(Ignored));
        assert!(New.can_transition_to(Duplicate));
        assert!(GroupPendingPair.can_transition_to(Converted));
        assert!(GroupPendingPair.can_transition_to(ConvertFailed));
        assert!(ConvertFailed.can_transition_to(GroupPendingPair));
        assert!(ConvertFailed.can_transition_to(Ignored));
        assert!(Converted.can_transition_to(GroupProcessed));
        assert!(SkippedHasEn2.can_transition_to(GroupProcessed));

        // Terminal statuses admit nothing
        assert!(!GroupProcessed.can_transition_to(New));
        assert!(!Ignored.can_transition_to(New));
        assert!(!Duplicate.can_transition_to(New));
        // Converted never regresses to convert-pending
        assert!(!Converted.can_transition_to(GroupPendingPair));
    }

    #[test]
    fn test_group_state_transitions() {
        use GroupState::*;
        assert!(Forming.can_transition_to(PendingPair));
        assert!(PendingPair.can_transition_to(ReadyToFinalize));
        assert!(ReadyToFinalize.can_transition_to(Processed));
        assert!(PendingPair.can_transition_to(Failed));
        assert!(Failed.can_transition_to(PendingPair)); // retry after size change

        assert!(!Processed.can_transition_to(Forming));
        assert!(!Processed.can_transition_to(Failed));
    }

    #[test]
    fn test_settled_statuses() {
        assert!(ProcessedStatus::SkippedHasEn2.is_settled());
        assert!(ProcessedStatus::Converted.is_settled());
        assert!(ProcessedStatus::GroupProcessed.is_settled());
        assert!(ProcessedStatus::Ignored.is_settled());
        assert!(ProcessedStatus::Duplicate.is_settled());
        assert!(!ProcessedStatus::New.is_settled());
        assert!(!ProcessedStatus::GroupPendingPair.is_settled());
        assert!(!ProcessedStatus::ConvertFailed.is_settled());
    }

    #[test]
    fn test_new_discovered_entry() {
        let entry = FileEntry::new_discovered(Path::new("/media/show/film.mkv"), 1000, 50);

        assert_eq!(entry.size_bytes, 1000);
        assert_eq!(entry.integrity, IntegrityStatus::Unknown);
        assert_eq!(entry.processed, ProcessedStatus::New);
        assert_eq!(entry.role, FileRole::Original);
        assert_eq!(entry.next_check_at, 50);
        assert_eq!(entry.discovered_at, 50);
        assert!(entry.stable_since.is_none());
        assert!(entry.is_due(50));
        assert!(!entry.is_terminal());
    }

    #[test]
    fn test_stability_window() {
        let mut entry = FileEntry::new_discovered(Path::new("/media/a.mkv"), 1000, 0);
        assert!(!entry.is_stable(100, 30));

        entry.stable_since = Some(10);
        assert!(!entry.is_stable(39, 30));
        assert!(entry.is_stable(40, 30));
        assert!(entry.is_stable(100, 30));
    }

    #[test]
    fn test_group_key_pairs_original_and_companion() {
        let (gid_orig, role_orig) = group_key(Path::new("/media/show/film.mkv"));
        let (gid_st, role_st) = group_key(Path::new("/media/show/film.stereo.mkv"));

        assert_eq!(gid_orig, gid_st);
        assert_eq!(role_orig, FileRole::Original);
        assert_eq!(role_st, FileRole::StereoCompanion);
    }

    #[test]
    fn test_group_key_distinguishes_directories() {
        let (a, _) = group_key(Path::new("/media/one/film.mkv"));
        let (b, _) = group_key(Path::new("/media/two/film.mkv"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_group_key_multi_dot_names() {
        // Only a trailing `.stereo` in the stem marks a companion
        let (_, role) = group_key(Path::new("/m/film.2024.1080p.mkv"));
        assert_eq!(role, FileRole::Original);

        let (gid_a, _) = group_key(Path::new("/m/film.2024.1080p.mkv"));
        let (gid_b, role_b) = group_key(Path::new("/m/film.2024.1080p.stereo.mkv"));
        assert_eq!(gid_a, gid_b);
        assert_eq!(role_b, FileRole::StereoCompanion);
    }

    // Statuses with no legal successors stay that way no matter the probe:
    // a terminal record can never be walked back by any event source.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_terminal_processed_admits_nothing(
            target_idx in 0usize..8,
        ) {
            let all = [
                ProcessedStatus::New,
                ProcessedStatus::SkippedHasEn2,
                ProcessedStatus::Converted,
                ProcessedStatus::ConvertFailed,
                ProcessedStatus::GroupPendingPair,
                ProcessedStatus::GroupProcessed,
                ProcessedStatus::Ignored,
                ProcessedStatus::Duplicate,
            ];
            let target = all[target_idx];
            for terminal in [
                ProcessedStatus::GroupProcessed,
                ProcessedStatus::Ignored,
                ProcessedStatus::Duplicate,
            ] {
                if target != terminal {
                    prop_assert!(!terminal.can_transition_to(target));
                }
            }
        }

        #[test]
        fn prop_group_key_same_basename_same_group(
            dir in "[a-z]{1,12}",
            name in "[a-zA-Z0-9_-]{1,20}",
            ext in prop_oneof![Just("mkv"), Just("mp4"), Just("avi")],
        ) {
            let original = PathBuf::from(format!("/media/{}/{}.{}", dir, name, ext));
            let companion = PathBuf::from(format!("/media/{}/{}.stereo.{}", dir, name, ext));

            let (gid_o, role_o) = group_key(&original);
            let (gid_c, role_c) = group_key(&companion);

            prop_assert_eq!(gid_o, gid_c);
            prop_assert_eq!(role_o, FileRole::Original);
            prop_assert_eq!(role_c, FileRole::StereoCompanion);
        }

        #[test]
        fn prop_file_entry_json_round_trip(
            size in 0u64..u64::MAX / 2,
            next_check in 0i64..NEVER_TS,
            attempts in 0u32..100,
            backoff in 0u64..10_000,
        ) {
            let mut entry = FileEntry::new_discovered(Path::new("/media/x.mkv"), size, 7);
            entry.next_check_at = next_check;
            entry.integrity_attempts = attempts;
            entry.backoff_sec = backoff;
            entry.integrity = IntegrityStatus::Incomplete;
            entry.last_error = Some("decode stalled".to_string());

            let json = serde_json::to_string(&entry).expect("serialize");
            let back: FileEntry = serde_json::from_str(&json).expect("deserialize");
            prop_assert_eq!(entry, back);
        }
    }
}
