//! Typed status values and their persisted integer codes.
//!
//! Every status is stored as a compact integer so rows stay readable without a
//! lookup table. Rebuild codes are banded: the tens group names the phase and
//! the unit digit names the state within it (`0` failed, `1` ready,
//! `2` in progress, `3` done). Business logic only ever sees the enums below;
//! `code()` / `from_code()` are the only places the arithmetic lives.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A persisted integer that does not decode to any known status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} status code {code}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub code: i32,
}

/// Network-reported backup code from which a backup's deals count as active.
pub const DEAL_ACTIVE_CODE: i32 = 45;

/// Status message written on a freshly submitted backup row.
pub const BACKUP_CREATED_MSG: &str = "Created";

/// Storage-status string a deal reports once a provider holds the slice.
pub const DEAL_ACTIVE_STORAGE_STATUS: &str = "StorageDealActive";

/// Display state of a backup, derived from the network's numeric code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Ready,
    BackingUp,
    Failed,
    Completed,
}

impl BackupState {
    pub fn from_code(code: i32) -> Self {
        if code >= DEAL_ACTIVE_CODE {
            BackupState::Completed
        } else if code > 0 && code % 10 == 0 {
            BackupState::Failed
        } else if code == 0 || code == 11 {
            BackupState::Ready
        } else {
            BackupState::BackingUp
        }
    }

    /// Only a backup with at least one active deal can be rebuilt.
    pub fn can_rebuild(self) -> bool {
        self == BackupState::Completed
    }

    pub fn label(self) -> &'static str {
        match self {
            BackupState::Ready => "ready",
            BackupState::BackingUp => "backing up",
            BackupState::Failed => "failed",
            BackupState::Completed => "completed",
        }
    }
}

/// Phases of a rebuild, in the order a record moves through them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildPhase {
    /// Retrieval staged on the network.
    Staging,
    /// Car-file download on the network side.
    CarDownload,
    /// Retrieval from a storage provider.
    Retrieve,
    /// Network-side car restore.
    CarRestore,
    /// Network-side store / content-address finalize.
    Store,
    /// Local download of the staged payload.
    Download,
    /// Local restore into the target bucket.
    Restore,
}

impl RebuildPhase {
    const ALL: [RebuildPhase; 7] = [
        RebuildPhase::Staging,
        RebuildPhase::CarDownload,
        RebuildPhase::Retrieve,
        RebuildPhase::CarRestore,
        RebuildPhase::Store,
        RebuildPhase::Download,
        RebuildPhase::Restore,
    ];

    pub fn band(self) -> i32 {
        match self {
            RebuildPhase::Staging => 100,
            RebuildPhase::CarDownload => 110,
            RebuildPhase::Retrieve => 120,
            RebuildPhase::CarRestore => 130,
            RebuildPhase::Store => 140,
            RebuildPhase::Download => 150,
            RebuildPhase::Restore => 160,
        }
    }

    fn from_band(band: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|phase| phase.band() == band)
    }

    /// Labels for failed, ready, in-progress and done, in that order.
    fn labels(self) -> [&'static str; 4] {
        match self {
            RebuildPhase::Staging => ["staging failed", "staging ready", "staging", "staged"],
            RebuildPhase::CarDownload => [
                "car download failed",
                "car download ready",
                "car downloading",
                "car downloaded",
            ],
            RebuildPhase::Retrieve => ["retrieve failed", "retrieve ready", "retrieving", "retrieved"],
            RebuildPhase::CarRestore => [
                "car restore failed",
                "car restore ready",
                "car restoring",
                "car restored",
            ],
            RebuildPhase::Store => ["store failed", "store ready", "storing", "stored"],
            RebuildPhase::Download => [
                "download failed",
                "download ready",
                "downloading",
                "downloaded",
            ],
            RebuildPhase::Restore => ["restore failed", "restore ready", "restoring", "restored"],
        }
    }
}

/// State within a single rebuild phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Failed,
    Ready,
    InProgress,
    Done,
}

impl PhaseState {
    fn offset(self) -> i32 {
        match self {
            PhaseState::Failed => 0,
            PhaseState::Ready => 1,
            PhaseState::InProgress => 2,
            PhaseState::Done => 3,
        }
    }

    fn from_offset(offset: i32) -> Option<Self> {
        match offset {
            0 => Some(PhaseState::Failed),
            1 => Some(PhaseState::Ready),
            2 => Some(PhaseState::InProgress),
            3 => Some(PhaseState::Done),
            _ => None,
        }
    }
}

/// Status of an object rebuild.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildStatus {
    /// Requested locally, nothing reported by the network yet.
    Created,
    Phase { phase: RebuildPhase, state: PhaseState },
}

impl RebuildStatus {
    /// Payload is finalized on the network and can be downloaded.
    pub const STORED: RebuildStatus = RebuildStatus::phase(RebuildPhase::Store, PhaseState::Done);

    /// Terminal success; never picked up by reconciliation again.
    pub const RESTORED: RebuildStatus =
        RebuildStatus::phase(RebuildPhase::Restore, PhaseState::Done);

    /// Legacy network code meaning "rebuild finished on the network side".
    const NETWORK_COMPLETED_CODE: i32 = 1;

    pub const fn phase(phase: RebuildPhase, state: PhaseState) -> Self {
        RebuildStatus::Phase { phase, state }
    }

    pub fn code(self) -> i32 {
        match self {
            RebuildStatus::Created => 0,
            RebuildStatus::Phase { phase, state } => phase.band() + state.offset(),
        }
    }

    pub fn from_code(code: i32) -> Result<Self, UnknownStatus> {
        let unknown = UnknownStatus {
            kind: "rebuild",
            code,
        };
        match code {
            0 => Ok(RebuildStatus::Created),
            Self::NETWORK_COMPLETED_CODE => Ok(Self::STORED),
            _ if code >= 100 => {
                let phase = RebuildPhase::from_band(code - code % 10).ok_or(unknown.clone())?;
                let state = PhaseState::from_offset(code % 10).ok_or(unknown)?;
                Ok(RebuildStatus::phase(phase, state))
            }
            _ => Err(unknown),
        }
    }

    /// True once the network has finalized the payload (or a later local phase).
    pub fn is_staged(self) -> bool {
        self.code() >= Self::STORED.code()
    }

    pub fn is_terminal(self) -> bool {
        self == Self::RESTORED
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            RebuildStatus::Phase {
                state: PhaseState::Failed,
                ..
            }
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            RebuildStatus::Created => "ready",
            RebuildStatus::Phase { phase, state } => phase.labels()[state.offset() as usize],
        }
    }
}

impl fmt::Display for RebuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.code())
    }
}

/// Lifecycle of an external-bucket import job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Failed,
    Ready,
    Importing,
    Imported,
}

impl ImportStatus {
    pub fn code(self) -> i32 {
        match self {
            ImportStatus::Failed => -1,
            ImportStatus::Ready => 0,
            ImportStatus::Importing => 1,
            ImportStatus::Imported => 2,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, UnknownStatus> {
        match code {
            -1 => Ok(ImportStatus::Failed),
            0 => Ok(ImportStatus::Ready),
            1 => Ok(ImportStatus::Importing),
            2 => Ok(ImportStatus::Imported),
            _ => Err(UnknownStatus {
                kind: "import",
                code,
            }),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ImportStatus::Failed => "failed",
            ImportStatus::Ready => "ready",
            ImportStatus::Importing => "importing",
            ImportStatus::Imported => "imported",
        }
    }
}

/// Whether a backup plan takes part in scheduled sweeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Disabled,
    Enabled,
}

impl PlanStatus {
    pub fn code(self) -> i32 {
        match self {
            PlanStatus::Disabled => 0,
            PlanStatus::Enabled => 1,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, UnknownStatus> {
        match code {
            0 => Ok(PlanStatus::Disabled),
            1 => Ok(PlanStatus::Enabled),
            _ => Err(UnknownStatus { kind: "plan", code }),
        }
    }
}
