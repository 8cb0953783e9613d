use bastion_core::{ArtifactFacts, BackupMode, BackupRecord, BackupStatus, DeleteDecision};
use bastion_storage::{LedgerStore, StorageError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CHAIN_LENGTH: usize = 14;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("backup {backup_id} not found")]
    NotFound { backup_id: String },
    #[error("chain {chain_id} has no members")]
    ChainNotFound { chain_id: String },
    #[error("chain integrity fault in {chain_id}: {reason}")]
    IntegrityFault { chain_id: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub max_chain_length: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
        }
    }
}

/// Space-efficiency figures derived from a byte producer's size facts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainMetrics {
    pub dedupe_ratio: f64,
    pub compression_ratio: f64,
    pub space_saved_bytes: u64,
}

impl ChainMetrics {
    pub fn from_facts(facts: &ArtifactFacts) -> Self {
        let original = facts.original_size;
        // Without dedup data the compressor saw the original stream.
        let deduped = facts.deduped_size.unwrap_or(original);

        let dedupe_ratio = match facts.deduped_size {
            Some(deduped) if deduped > 0 && original > 0 => original as f64 / deduped as f64,
            _ => 1.0,
        };
        let compression_ratio = match facts.compressed_size {
            Some(compressed) if compressed > 0 && deduped > 0 => deduped as f64 / compressed as f64,
            _ => 1.0,
        };
        let space_saved_bytes = facts
            .compressed_size
            .map(|compressed| original.saturating_sub(compressed))
            .unwrap_or(0);

        Self {
            dedupe_ratio,
            compression_ratio,
            space_saved_bytes,
        }
    }

    fn apply(&self, backup: &mut BackupRecord) {
        backup.dedupe_ratio = self.dedupe_ratio;
        backup.compression_ratio = self.compression_ratio;
        backup.space_saved_bytes = self.space_saved_bytes;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainIntegrityReport {
    pub chain_id: String,
    pub member_count: usize,
    pub valid: bool,
    pub restorable: bool,
    pub critical_issues: Vec<String>,
    pub warnings: Vec<String>,
    pub non_completed_backup_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainStatistics {
    pub chain_id: String,
    pub member_count: usize,
    pub completed_count: usize,
    pub incremental_count: usize,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    pub total_space_saved_bytes: u64,
    pub first_completed_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// Operator-facing plan for merging a long chain into a new FULL backup.
/// The byte-level merge happens elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidationPlan {
    pub chain_id: String,
    pub ordered_backup_ids: Vec<String>,
    pub projected_full_backup_id: String,
    pub incremental_count: usize,
    pub stats: ChainStatistics,
}

pub struct ChainManager {
    config: ChainConfig,
}

impl ChainManager {
    pub fn new(config: ChainConfig) -> Self {
        Self { config }
    }

    /// Assigns chain id, parent and sequence number to a freshly created
    /// backup and refreshes its size metrics. An INCREMENTAL request with no
    /// completed predecessor starts a new chain as FULL.
    pub fn initialize_chain(
        &self,
        store: &LedgerStore,
        backup_id: &str,
        mode: BackupMode,
    ) -> Result<BackupRecord, ChainError> {
        let mut backup = load_backup(store, backup_id)?;
        let predecessor = match mode {
            BackupMode::Full => None,
            BackupMode::Incremental => store.latest_completed_for_source(
                backup.source_type,
                &backup.source_id,
                &backup.id,
            )?,
        };

        match predecessor {
            Some(predecessor) => {
                let Some(chain_id) = predecessor.chain_id.clone() else {
                    return Err(ChainError::IntegrityFault {
                        chain_id: "<none>".to_string(),
                        reason: format!(
                            "predecessor {} is completed but was never assigned a chain",
                            predecessor.id
                        ),
                    });
                };
                backup.mode = BackupMode::Incremental;
                backup.chain_id = Some(chain_id);
                backup.parent_backup_id = Some(predecessor.id.clone());
                backup.sequence_number = predecessor.sequence_number + 1;
            }
            None => {
                if mode == BackupMode::Incremental {
                    info!(
                        event = "incremental_promoted_to_full",
                        backup_id = %backup.id,
                        source_id = %backup.source_id
                    );
                }
                backup.mode = BackupMode::Full;
                backup.chain_id = Some(uuid::Uuid::new_v4().to_string());
                backup.parent_backup_id = None;
                backup.sequence_number = 0;
            }
        }

        ChainMetrics::from_facts(&facts_of(&backup)).apply(&mut backup);
        store.upsert_backup(&backup)?;

        info!(
            event = "chain_initialized",
            backup_id = %backup.id,
            chain_id = backup.chain_id.as_deref().unwrap_or_default(),
            sequence = backup.sequence_number,
            mode = %backup.mode
        );
        Ok(backup)
    }

    /// Records a byte producer's completion report and recomputes metrics.
    pub fn complete_backup(
        &self,
        store: &LedgerStore,
        backup_id: &str,
        facts: &ArtifactFacts,
        completed_at: DateTime<Utc>,
    ) -> Result<BackupRecord, ChainError> {
        let mut backup = load_backup(store, backup_id)?;
        backup.original_size_bytes = facts.original_size;
        backup.deduped_size_bytes = facts.deduped_size;
        backup.compressed_size_bytes = facts.compressed_size;
        backup.status = BackupStatus::Completed;
        backup.completed_at = Some(completed_at);
        ChainMetrics::from_facts(facts).apply(&mut backup);
        store.upsert_backup(&backup)?;

        debug!(
            event = "backup_completed",
            backup_id = %backup.id,
            dedupe_ratio = backup.dedupe_ratio,
            compression_ratio = backup.compression_ratio,
            space_saved_bytes = backup.space_saved_bytes
        );
        Ok(backup)
    }

    /// The minimal ordered set of backups needed to rebuild `backup_id`,
    /// found by following parent pointers back to the FULL. Siblings that
    /// share a sequence number (a failed attempt and its retry) never enter
    /// the path.
    pub fn get_chain_for_restore(
        &self,
        store: &LedgerStore,
        backup_id: &str,
    ) -> Result<Vec<BackupRecord>, ChainError> {
        let target = load_backup(store, backup_id)?;
        if target.mode == BackupMode::Full {
            return Ok(vec![target]);
        }

        let Some(chain_id) = target.chain_id.clone() else {
            return Err(ChainError::IntegrityFault {
                chain_id: "<none>".to_string(),
                reason: format!("incremental backup {} has no chain", target.id),
            });
        };
        let fault = |reason: String| ChainError::IntegrityFault {
            chain_id: chain_id.clone(),
            reason,
        };

        let mut seen = BTreeSet::from([target.id.clone()]);
        let mut path = vec![target];
        loop {
            let child = &path[path.len() - 1];
            if child.mode == BackupMode::Full {
                break;
            }
            let Some(parent_id) = child.parent_backup_id.clone() else {
                return Err(fault(format!(
                    "incremental backup {} has no parent",
                    child.id
                )));
            };
            if !seen.insert(parent_id.clone()) {
                return Err(fault(format!(
                    "parent pointers form a cycle through {parent_id}"
                )));
            }
            let Some(parent) = store.backup(&parent_id)? else {
                return Err(fault(format!(
                    "backup {} points at missing parent {parent_id}",
                    child.id
                )));
            };
            if parent.chain_id.as_deref() != Some(chain_id.as_str()) {
                return Err(fault(format!(
                    "parent {} of {} belongs to another chain",
                    parent.id, child.id
                )));
            }
            if parent.sequence_number + 1 != child.sequence_number {
                return Err(fault(format!(
                    "parent {} has sequence {} but child {} has sequence {}",
                    parent.id, parent.sequence_number, child.id, child.sequence_number
                )));
            }
            if !parent.is_completed() {
                return Err(fault(format!(
                    "restore path to {} passes through {} backup {}",
                    backup_id, parent.status, parent.id
                )));
            }
            path.push(parent);
        }

        if path.last().is_some_and(|base| base.sequence_number != 0) {
            return Err(fault(format!(
                "restore path to {backup_id} does not start at sequence 0"
            )));
        }
        path.reverse();
        Ok(path)
    }

    /// Dependency check only; immutability is judged separately.
    pub fn can_delete(
        &self,
        store: &LedgerStore,
        backup_id: &str,
    ) -> Result<DeleteDecision, ChainError> {
        if store.backup(backup_id)?.is_none() {
            return Ok(DeleteDecision::deny(format!("backup {backup_id} not found")));
        }
        let dependents = store.children_of(backup_id)?;
        if dependents.is_empty() {
            return Ok(DeleteDecision::allow());
        }
        Ok(DeleteDecision::deny(format!(
            "{} dependent backup(s) exist",
            dependents.len()
        )))
    }

    pub fn dependents(
        &self,
        store: &LedgerStore,
        backup_id: &str,
    ) -> Result<Vec<BackupRecord>, ChainError> {
        Ok(store.children_of(backup_id)?)
    }

    pub fn chain_members(
        &self,
        store: &LedgerStore,
        chain_id: &str,
    ) -> Result<Vec<BackupRecord>, ChainError> {
        Ok(store.chain_members(chain_id)?)
    }

    /// Backups pointing at a parent that no longer exists. Reported, never repaired.
    pub fn find_orphaned(&self, store: &LedgerStore) -> Result<Vec<BackupRecord>, ChainError> {
        let orphans = store.orphaned_backups()?;
        for orphan in &orphans {
            warn!(
                event = "orphaned_backup",
                backup_id = %orphan.id,
                missing_parent = orphan.parent_backup_id.as_deref().unwrap_or_default(),
                chain_id = orphan.chain_id.as_deref().unwrap_or_default()
            );
        }
        Ok(orphans)
    }

    pub fn verify_chain_integrity(
        &self,
        store: &LedgerStore,
        chain_id: &str,
    ) -> Result<ChainIntegrityReport, ChainError> {
        let members = store.chain_members(chain_id)?;
        let report = inspect_chain(chain_id, &members);
        if !report.valid {
            warn!(
                event = "chain_integrity_critical",
                chain_id,
                issues = report.critical_issues.len()
            );
        } else if !report.warnings.is_empty() {
            info!(
                event = "chain_integrity_warnings",
                chain_id,
                warnings = report.warnings.len()
            );
        }
        Ok(report)
    }

    pub fn chain_statistics(
        &self,
        store: &LedgerStore,
        chain_id: &str,
    ) -> Result<ChainStatistics, ChainError> {
        let members = store.chain_members(chain_id)?;
        if members.is_empty() {
            return Err(ChainError::ChainNotFound {
                chain_id: chain_id.to_string(),
            });
        }
        Ok(statistics_for(chain_id, &members))
    }

    pub fn plan_consolidation(
        &self,
        store: &LedgerStore,
        chain_id: &str,
    ) -> Result<ConsolidationPlan, ChainError> {
        let completed = store
            .chain_members(chain_id)?
            .into_iter()
            .filter(BackupRecord::is_completed)
            .collect::<Vec<_>>();
        build_plan(chain_id, &completed).ok_or_else(|| ChainError::ChainNotFound {
            chain_id: chain_id.to_string(),
        })
    }

    /// Chains whose completed member count exceeds `max_chain_length`.
    pub fn chains_needing_consolidation(
        &self,
        store: &LedgerStore,
        max_chain_length: Option<usize>,
    ) -> Result<Vec<ConsolidationPlan>, ChainError> {
        let threshold = max_chain_length.unwrap_or(self.config.max_chain_length);
        let mut chains = BTreeMap::<String, Vec<BackupRecord>>::new();
        for backup in store.completed_backups()? {
            if let Some(chain_id) = backup.chain_id.clone() {
                chains.entry(chain_id).or_default().push(backup);
            }
        }

        let mut plans = Vec::new();
        for (chain_id, mut members) in chains {
            if members.len() <= threshold {
                continue;
            }
            members.sort_by_key(|member| member.sequence_number);
            if let Some(plan) = build_plan(&chain_id, &members) {
                plans.push(plan);
            }
        }
        Ok(plans)
    }
}

fn load_backup(store: &LedgerStore, backup_id: &str) -> Result<BackupRecord, ChainError> {
    store
        .backup(backup_id)?
        .ok_or_else(|| ChainError::NotFound {
            backup_id: backup_id.to_string(),
        })
}

fn facts_of(backup: &BackupRecord) -> ArtifactFacts {
    ArtifactFacts {
        original_size: backup.original_size_bytes,
        deduped_size: backup.deduped_size_bytes,
        compressed_size: backup.compressed_size_bytes,
    }
}

fn inspect_chain(chain_id: &str, members: &[BackupRecord]) -> ChainIntegrityReport {
    let mut critical_issues = Vec::new();
    let mut warnings = Vec::new();

    let Some(first) = members.first() else {
        return ChainIntegrityReport {
            chain_id: chain_id.to_string(),
            member_count: 0,
            valid: false,
            restorable: false,
            critical_issues: vec!["chain has no members".to_string()],
            warnings,
            non_completed_backup_ids: Vec::new(),
        };
    };

    if first.mode != BackupMode::Full {
        critical_issues.push(format!(
            "first member {} is {} rather than FULL",
            first.id, first.mode
        ));
    }
    if first.parent_backup_id.is_some() {
        warnings.push(format!("first member {} has a parent pointer", first.id));
    }

    for (position, member) in members.iter().enumerate() {
        if member.sequence_number as usize != position {
            warnings.push(format!(
                "sequence gap: member {} has sequence {} at position {}",
                member.id, member.sequence_number, position
            ));
        }
        if position > 0 {
            let previous = &members[position - 1];
            if member.parent_backup_id.as_deref() != Some(previous.id.as_str()) {
                warnings.push(format!(
                    "broken link: member {} points at {} instead of {}",
                    member.id,
                    member.parent_backup_id.as_deref().unwrap_or("nothing"),
                    previous.id
                ));
            }
        }
    }

    if let Some(cycle_at) = find_parent_cycle(members) {
        critical_issues.push(format!("parent pointers form a cycle through {cycle_at}"));
    }

    let non_completed_backup_ids = members
        .iter()
        .filter(|member| !member.is_completed())
        .map(|member| member.id.clone())
        .collect::<Vec<_>>();
    if !non_completed_backup_ids.is_empty() {
        warnings.push(format!(
            "non-completed members: {}",
            non_completed_backup_ids.join(", ")
        ));
    }

    let restorable = first.is_completed() && members.iter().any(BackupRecord::is_completed);

    ChainIntegrityReport {
        chain_id: chain_id.to_string(),
        member_count: members.len(),
        valid: critical_issues.is_empty(),
        restorable,
        critical_issues,
        warnings,
        non_completed_backup_ids,
    }
}

/// Follows parent pointers from every member; returns the id where a walk
/// revisits itself.
fn find_parent_cycle(members: &[BackupRecord]) -> Option<String> {
    let parents = members
        .iter()
        .map(|member| (member.id.as_str(), member.parent_backup_id.as_deref()))
        .collect::<BTreeMap<_, _>>();

    for member in members {
        let mut seen = BTreeSet::new();
        let mut cursor = Some(member.id.as_str());
        while let Some(current) = cursor {
            if !seen.insert(current) {
                return Some(current.to_string());
            }
            cursor = parents.get(current).copied().flatten();
        }
    }
    None
}

fn statistics_for(chain_id: &str, members: &[BackupRecord]) -> ChainStatistics {
    let completed = members
        .iter()
        .filter(|member| member.is_completed())
        .collect::<Vec<_>>();
    let completion_times = completed
        .iter()
        .filter_map(|member| member.completed_at)
        .collect::<Vec<_>>();

    ChainStatistics {
        chain_id: chain_id.to_string(),
        member_count: members.len(),
        completed_count: completed.len(),
        incremental_count: members
            .iter()
            .filter(|member| member.mode == BackupMode::Incremental)
            .count(),
        total_original_bytes: completed
            .iter()
            .map(|member| member.original_size_bytes)
            .sum(),
        total_compressed_bytes: completed
            .iter()
            .map(|member| {
                member
                    .compressed_size_bytes
                    .unwrap_or(member.original_size_bytes)
            })
            .sum(),
        total_space_saved_bytes: completed
            .iter()
            .map(|member| member.space_saved_bytes)
            .sum(),
        first_completed_at: completion_times.iter().min().copied(),
        last_completed_at: completion_times.iter().max().copied(),
    }
}

fn build_plan(chain_id: &str, completed: &[BackupRecord]) -> Option<ConsolidationPlan> {
    let projected = completed.last()?;
    Some(ConsolidationPlan {
        chain_id: chain_id.to_string(),
        ordered_backup_ids: completed.iter().map(|member| member.id.clone()).collect(),
        projected_full_backup_id: projected.id.clone(),
        incremental_count: completed
            .iter()
            .filter(|member| member.mode == BackupMode::Incremental)
            .count(),
        stats: statistics_for(chain_id, completed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::SourceType;
    use chrono::{Duration, TimeZone};

    fn ts(offset_hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 1, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::hours(offset_hours)
    }

    fn manager() -> ChainManager {
        ChainManager::new(ChainConfig::default())
    }

    fn facts() -> ArtifactFacts {
        ArtifactFacts {
            original_size: 1_000,
            deduped_size: Some(500),
            compressed_size: Some(250),
        }
    }

    /// Creates, chains and completes one backup, the way scheduler and byte
    /// producer drive the engine.
    fn run_backup(
        store: &LedgerStore,
        manager: &ChainManager,
        source_id: &str,
        mode: BackupMode,
        hour: i64,
    ) -> BackupRecord {
        let pending = BackupRecord::pending(SourceType::Vm, source_id, mode, ts(hour));
        store.upsert_backup(&pending).expect("insert pending");
        manager
            .initialize_chain(store, &pending.id, mode)
            .expect("initialize chain");
        manager
            .complete_backup(store, &pending.id, &facts(), ts(hour) + Duration::minutes(10))
            .expect("complete")
    }

    fn full_plus_incrementals(store: &LedgerStore, count: usize) -> Vec<BackupRecord> {
        let manager = manager();
        let mut backups = vec![run_backup(store, &manager, "vm-1", BackupMode::Full, 0)];
        for index in 0..count {
            backups.push(run_backup(
                store,
                &manager,
                "vm-1",
                BackupMode::Incremental,
                index as i64 + 1,
            ));
        }
        backups
    }

    #[test]
    fn metrics_follow_size_facts_and_default_when_missing() {
        let metrics = ChainMetrics::from_facts(&facts());
        assert_eq!(metrics.dedupe_ratio, 2.0);
        assert_eq!(metrics.compression_ratio, 2.0);
        assert_eq!(metrics.space_saved_bytes, 750);

        let bare = ChainMetrics::from_facts(&ArtifactFacts {
            original_size: 1_000,
            deduped_size: None,
            compressed_size: None,
        });
        assert_eq!(bare.dedupe_ratio, 1.0);
        assert_eq!(bare.compression_ratio, 1.0);
        assert_eq!(bare.space_saved_bytes, 0);

        let zero = ChainMetrics::from_facts(&ArtifactFacts {
            original_size: 0,
            deduped_size: Some(0),
            compressed_size: Some(0),
        });
        assert_eq!(zero.dedupe_ratio, 1.0);
        assert_eq!(zero.compression_ratio, 1.0);

        let inflated = ChainMetrics::from_facts(&ArtifactFacts {
            original_size: 100,
            deduped_size: None,
            compressed_size: Some(120),
        });
        assert_eq!(inflated.space_saved_bytes, 0);
    }

    #[test]
    fn full_then_incrementals_get_contiguous_sequence_numbers() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let backups = full_plus_incrementals(&store, 5);

        let sequences = backups
            .iter()
            .map(|backup| backup.sequence_number)
            .collect::<Vec<_>>();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5]);

        let chain_id = backups[0].chain_id.clone().expect("chain id");
        assert!(backups
            .iter()
            .all(|backup| backup.chain_id.as_deref() == Some(chain_id.as_str())));
        assert!(backups[0].parent_backup_id.is_none());
        for pair in backups.windows(2) {
            assert_eq!(pair[1].parent_backup_id.as_deref(), Some(pair[0].id.as_str()));
        }
        assert_eq!(backups[3].dedupe_ratio, 2.0);
    }

    #[test]
    fn incremental_without_predecessor_starts_full_chain() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let backup = run_backup(&store, &manager(), "vm-9", BackupMode::Incremental, 0);
        assert_eq!(backup.mode, BackupMode::Full);
        assert_eq!(backup.sequence_number, 0);
        assert!(backup.parent_backup_id.is_none());
        assert!(backup.chain_id.is_some());
    }

    #[test]
    fn full_backup_always_starts_a_new_chain() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let manager = manager();
        let first = run_backup(&store, &manager, "vm-1", BackupMode::Full, 0);
        let second = run_backup(&store, &manager, "vm-1", BackupMode::Full, 1);
        assert_ne!(first.chain_id, second.chain_id);
        assert_eq!(second.sequence_number, 0);
    }

    #[test]
    fn restore_of_sequence_three_needs_four_backups() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let backups = full_plus_incrementals(&store, 5);

        let restore = manager()
            .get_chain_for_restore(&store, &backups[3].id)
            .expect("restore chain");
        assert_eq!(restore.len(), 4);
        assert_eq!(
            restore
                .iter()
                .map(|backup| backup.sequence_number)
                .collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );

        let full_only = manager()
            .get_chain_for_restore(&store, &backups[0].id)
            .expect("restore full");
        assert_eq!(full_only.len(), 1);
        assert_eq!(full_only[0].id, backups[0].id);
    }

    #[test]
    fn restore_skips_a_failed_sibling_at_the_same_sequence() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let manager = manager();
        let full = run_backup(&store, &manager, "vm-1", BackupMode::Full, 0);

        let attempt = BackupRecord::pending(SourceType::Vm, "vm-1", BackupMode::Incremental, ts(1));
        store.upsert_backup(&attempt).expect("insert pending");
        let mut failed = manager
            .initialize_chain(&store, &attempt.id, BackupMode::Incremental)
            .expect("initialize chain");
        failed.status = BackupStatus::Failed;
        store.upsert_backup(&failed).expect("mark failed");

        let retry = run_backup(&store, &manager, "vm-1", BackupMode::Incremental, 2);
        let next = run_backup(&store, &manager, "vm-1", BackupMode::Incremental, 3);
        assert_eq!(failed.sequence_number, 1);
        assert_eq!(retry.sequence_number, 1);
        assert_eq!(next.sequence_number, 2);

        let restore = manager
            .get_chain_for_restore(&store, &next.id)
            .expect("restore chain");
        let ids = restore
            .iter()
            .map(|backup| backup.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![full.id.as_str(), retry.id.as_str(), next.id.as_str()]);
    }

    #[test]
    fn restore_refuses_a_missing_parent() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let mut backups = full_plus_incrementals(&store, 3);
        backups[2].parent_backup_id = Some("deleted-parent".to_string());
        store.upsert_backup(&backups[2]).expect("update");

        let err = manager()
            .get_chain_for_restore(&store, &backups[3].id)
            .expect_err("missing parent must be reported");
        assert!(
            matches!(err, ChainError::IntegrityFault { ref reason, .. } if reason.contains("deleted-parent"))
        );
    }

    #[test]
    fn restore_refuses_an_unfinished_ancestor_and_a_cycle() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let mut backups = full_plus_incrementals(&store, 3);
        backups[1].status = BackupStatus::Running;
        store.upsert_backup(&backups[1]).expect("update");

        let err = manager()
            .get_chain_for_restore(&store, &backups[3].id)
            .expect_err("running ancestor");
        assert!(
            matches!(err, ChainError::IntegrityFault { ref reason, .. } if reason.contains(&backups[1].id))
        );

        backups[1].status = BackupStatus::Completed;
        backups[1].parent_backup_id = Some(backups[2].id.clone());
        store.upsert_backup(&backups[1]).expect("update");
        let err = manager()
            .get_chain_for_restore(&store, &backups[3].id)
            .expect_err("cycle");
        assert!(matches!(err, ChainError::IntegrityFault { .. }));
    }

    #[test]
    fn backup_with_child_cannot_be_deleted() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let backups = full_plus_incrementals(&store, 3);
        let manager = manager();

        let decision = manager
            .can_delete(&store, &backups[2].id)
            .expect("decision");
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("1 dependent backup(s) exist"));

        let tip = manager.can_delete(&store, &backups[3].id).expect("decision");
        assert!(tip.allowed);

        let missing = manager.can_delete(&store, "nope").expect("decision");
        assert!(!missing.allowed);
    }

    #[test]
    fn orphans_are_reported_not_dropped() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let backups = full_plus_incrementals(&store, 2);
        let mut orphan = backups[2].clone();
        orphan.parent_backup_id = Some("deleted-parent".to_string());
        store.upsert_backup(&orphan).expect("update");

        let orphans = manager().find_orphaned(&store).expect("orphans");
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, orphan.id);
        assert!(store.backup(&orphan.id).expect("query").is_some());
    }

    #[test]
    fn healthy_chain_verifies_clean() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let backups = full_plus_incrementals(&store, 3);
        let chain_id = backups[0].chain_id.clone().expect("chain");

        let report = manager()
            .verify_chain_integrity(&store, &chain_id)
            .expect("report");
        assert!(report.valid);
        assert!(report.restorable);
        assert!(report.warnings.is_empty());
        assert_eq!(report.member_count, 4);
    }

    #[test]
    fn integrity_report_flags_gaps_links_and_unfinished_members() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let mut backups = full_plus_incrementals(&store, 3);
        backups[2].sequence_number = 7;
        backups[2].status = BackupStatus::Failed;
        store.upsert_backup(&backups[2]).expect("update");
        let chain_id = backups[0].chain_id.clone().expect("chain");

        let report = manager()
            .verify_chain_integrity(&store, &chain_id)
            .expect("report");
        assert!(report.valid);
        assert!(report.restorable);
        assert_eq!(report.non_completed_backup_ids, vec![backups[2].id.clone()]);
        assert!(report.warnings.iter().any(|w| w.starts_with("sequence gap")));
        assert!(report.warnings.iter().any(|w| w.starts_with("broken link")));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.starts_with("non-completed members")));
    }

    #[test]
    fn chain_starting_with_incremental_is_critical() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let mut backups = full_plus_incrementals(&store, 1);
        backups[0].mode = BackupMode::Incremental;
        backups[0].status = BackupStatus::Running;
        store.upsert_backup(&backups[0]).expect("update");
        let chain_id = backups[0].chain_id.clone().expect("chain");

        let report = manager()
            .verify_chain_integrity(&store, &chain_id)
            .expect("report");
        assert!(!report.valid);
        assert!(!report.restorable);
        assert_eq!(report.critical_issues.len(), 1);
    }

    #[test]
    fn parent_cycle_is_detected() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let mut backups = full_plus_incrementals(&store, 2);
        backups[0].parent_backup_id = Some(backups[2].id.clone());
        store.upsert_backup(&backups[0]).expect("update");
        let chain_id = backups[0].chain_id.clone().expect("chain");

        let report = manager()
            .verify_chain_integrity(&store, &chain_id)
            .expect("report");
        assert!(!report.valid);
        assert!(report
            .critical_issues
            .iter()
            .any(|issue| issue.contains("cycle")));
    }

    #[test]
    fn empty_chain_is_invalid() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let report = manager()
            .verify_chain_integrity(&store, "missing")
            .expect("report");
        assert!(!report.valid);
        assert!(!report.restorable);
    }

    #[test]
    fn long_chains_produce_consolidation_plans() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let backups = full_plus_incrementals(&store, 5);
        let manager = manager();
        run_backup(&store, &manager, "vm-2", BackupMode::Full, 0);

        let plans = manager
            .chains_needing_consolidation(&store, Some(4))
            .expect("plans");
        assert_eq!(plans.len(), 1);
        let plan = &plans[0];
        assert_eq!(plan.chain_id, backups[0].chain_id.clone().expect("chain"));
        assert_eq!(plan.ordered_backup_ids.len(), 6);
        assert_eq!(plan.ordered_backup_ids[0], backups[0].id);
        assert_eq!(plan.projected_full_backup_id, backups[5].id);
        assert_eq!(plan.incremental_count, 5);
        assert_eq!(plan.stats.total_original_bytes, 6_000);
        assert_eq!(plan.stats.total_space_saved_bytes, 4_500);

        assert!(manager
            .chains_needing_consolidation(&store, None)
            .expect("plans")
            .is_empty());
    }

    #[test]
    fn statistics_for_unknown_chain_is_not_found() {
        let store = LedgerStore::open_in_memory().expect("open db");
        assert!(matches!(
            manager().chain_statistics(&store, "nope"),
            Err(ChainError::ChainNotFound { .. })
        ));
    }
}
