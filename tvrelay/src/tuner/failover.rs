//! Backup channel failover.
//!
//! A viewer request walks `Primary → Backup1 → Backup2 → Backup3 →
//! Exhausted`, moving forward exactly one stage per failure. Stages without
//! a configured backup are skipped, and no stage is visited twice.

use tvrelay_protocol::{BackupChannel, ChannelRequest, StreamTarget, MAX_BACKUPS};

/// Position of a request in its failover sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverStage {
    Primary,
    Backup1,
    Backup2,
    Backup3,
    Exhausted,
}

impl FailoverStage {
    fn next(self) -> Self {
        match self {
            FailoverStage::Primary => FailoverStage::Backup1,
            FailoverStage::Backup1 => FailoverStage::Backup2,
            FailoverStage::Backup2 => FailoverStage::Backup3,
            FailoverStage::Backup3 | FailoverStage::Exhausted => FailoverStage::Exhausted,
        }
    }

    fn backup_index(self) -> Option<usize> {
        match self {
            FailoverStage::Backup1 => Some(0),
            FailoverStage::Backup2 => Some(1),
            FailoverStage::Backup3 => Some(2),
            _ => None,
        }
    }
}

/// Ordered upstream targets for one viewer request.
#[derive(Debug, Clone)]
pub struct FailoverPlan {
    primary: StreamTarget,
    backups: Vec<BackupChannel>,
    stage: FailoverStage,
}

impl FailoverPlan {
    pub fn new(request: &ChannelRequest) -> Self {
        let backups = request.backups.iter().take(MAX_BACKUPS).cloned().collect();
        Self {
            primary: request.primary(),
            backups,
            stage: FailoverStage::Primary,
        }
    }

    pub fn stage(&self) -> FailoverStage {
        self.stage
    }

    /// Target of the current stage, `None` once exhausted.
    pub fn current(&self) -> Option<StreamTarget> {
        match self.stage {
            FailoverStage::Primary => Some(self.primary.clone()),
            FailoverStage::Exhausted => None,
            stage => stage
                .backup_index()
                .and_then(|i| self.backups.get(i))
                .map(StreamTarget::from),
        }
    }

    /// Backups not yet tried after the current stage.
    pub fn remaining_backups(&self) -> &[BackupChannel] {
        let tried = match self.stage {
            FailoverStage::Primary => 0,
            FailoverStage::Exhausted => self.backups.len(),
            stage => stage.backup_index().map_or(0, |i| i + 1),
        };
        &self.backups[tried.min(self.backups.len())..]
    }

    /// Move to the next stage after a failure and return its target.
    pub fn advance(&mut self) -> Option<StreamTarget> {
        self.stage = self.stage.next();
        if let Some(i) = self.stage.backup_index() {
            if i >= self.backups.len() {
                self.stage = FailoverStage::Exhausted;
            }
        }
        self.current()
    }
}
