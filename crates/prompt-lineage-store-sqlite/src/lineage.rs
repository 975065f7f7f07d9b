use prompt_lineage_core::{
    ChangeKind, MethodologyRecord, NewPrompt, PromptId, PromptRecord, Transform, ValidationError,
};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::query::{latest_in_lineage_id_in, latest_prompt_id_in};
use crate::records::{find_prompt, insert_prompt_in};
use crate::{SqliteStore, StoreError};

/// Which record a save continues from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    /// Continue the most recently created record in the whole store.
    #[default]
    Continue,
    /// Start a new lineage regardless of what exists.
    NewLineage,
    /// Continue the newest version of the lineage rooted at this id.
    ContinueLineage(PromptId),
}

/// Versioned save paths over a [`SqliteStore`].
///
/// Every save computes its parent, version, and lineage root inside the same
/// transaction that writes the record.
pub struct LineageManager<'s> {
    store: &'s mut SqliteStore,
}

impl<'s> LineageManager<'s> {
    pub fn new(store: &'s mut SqliteStore) -> Self {
        Self { store }
    }

    /// Save `content` as a manual edit of the latest record, or as a new
    /// lineage when the store is empty or `mode` asks for one.
    ///
    /// # Errors
    /// Returns a validation error for blank content, [`StoreError::NotFound`]
    /// for an unknown lineage in [`SaveMode::ContinueLineage`], or an invariant
    /// or storage error. Nothing is written on error.
    pub fn save(&mut self, content: &str, mode: SaveMode) -> Result<PromptRecord, StoreError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        let record = self.store.with_transaction(|tx| save_in(tx, content, mode))?;
        info!(
            id = %record.id,
            version = record.version_number,
            lineage_root = %record.effective_lineage_root(),
            "saved prompt"
        );
        Ok(record)
    }

    /// Checkpoint `content`, run `transform` on it, and save the result as a
    /// methodology application whose parent is the checkpoint.
    ///
    /// The checkpoint commits before the transform starts and is kept if the
    /// transform fails. Partial output only reaches `progress`.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] for an unknown methodology (before any
    /// write), [`StoreError::TransformFailure`] when the transform fails, or a
    /// validation error when it produces blank text.
    pub fn apply_methodology(
        &mut self,
        content: &str,
        methodology: &MethodologyRecord,
        transform: &mut dyn Transform,
        progress: &mut dyn FnMut(&str),
    ) -> Result<PromptRecord, StoreError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        let methodology = self.store.get_methodology(methodology.id)?;

        let checkpoint = self.save(content, SaveMode::Continue)?;
        debug!(checkpoint = %checkpoint.id, methodology = %methodology.name, "starting transform");

        let transformed = match transform.transform(content, &methodology, progress) {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    checkpoint = %checkpoint.id,
                    methodology = %methodology.name,
                    error = %err,
                    "transform failed; checkpoint kept"
                );
                return Err(err.into());
            }
        };
        if transformed.trim().is_empty() {
            warn!(methodology = %methodology.name, "transform produced blank output");
            return Err(ValidationError::EmptyContent.into());
        }

        let record = self.store.with_transaction(|tx| {
            let parent =
                find_prompt(tx, checkpoint.id)?.ok_or(StoreError::ParentNotFound(checkpoint.id))?;
            let candidate = NewPrompt::child_of(&parent, &transformed, ChangeKind::MethodologyApply)
                .with_methodology(methodology.id);
            insert_prompt_in(tx, &candidate)
        })?;
        info!(
            id = %record.id,
            checkpoint = %checkpoint.id,
            methodology = %methodology.name,
            version = record.version_number,
            "applied methodology"
        );
        Ok(record)
    }
}

fn save_in(conn: &Connection, content: &str, mode: SaveMode) -> Result<PromptRecord, StoreError> {
    let parent_id = match mode {
        SaveMode::NewLineage => None,
        SaveMode::Continue => latest_prompt_id_in(conn)?,
        SaveMode::ContinueLineage(root) => Some(
            latest_in_lineage_id_in(conn, root)?
                .ok_or_else(|| StoreError::not_found("lineage", root))?,
        ),
    };

    let candidate = match parent_id {
        None => NewPrompt::initial(content),
        Some(parent_id) => {
            let parent = find_prompt(conn, parent_id)?.ok_or(StoreError::ParentNotFound(parent_id))?;
            NewPrompt::child_of(&parent, content, ChangeKind::ManualEdit)
        }
    };
    debug!(
        ?mode,
        parent = ?candidate.parent_id,
        version = candidate.version_number,
        "computed save candidate"
    );
    insert_prompt_in(conn, &candidate)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use anyhow::{anyhow, Result};
    use prompt_lineage_core::{Invariant, InvariantViolation, TransformError};
    use proptest::prelude::*;

    use super::*;

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn uppercase(
        content: &str,
        _methodology: &MethodologyRecord,
        progress: &mut dyn FnMut(&str),
    ) -> Result<String, TransformError> {
        progress("partial");
        Ok(content.to_uppercase())
    }

    #[test]
    fn first_save_on_empty_store_starts_a_lineage() -> Result<()> {
        let mut store = migrated_store()?;
        let a = LineageManager::new(&mut store).save("A", SaveMode::Continue)?;
        assert_eq!(a.version_number, 1);
        assert_eq!(a.parent_id, None);
        assert_eq!(a.lineage_root_id, Some(a.id));
        assert_eq!(a.change_kind, ChangeKind::Initial);
        Ok(())
    }

    #[test]
    fn plain_save_continues_the_latest_record() -> Result<()> {
        let mut store = migrated_store()?;
        let mut lineage = LineageManager::new(&mut store);
        let a = lineage.save("A", SaveMode::Continue)?;
        let b = lineage.save("B", SaveMode::Continue)?;
        assert_eq!(b.version_number, 2);
        assert_eq!(b.parent_id, Some(a.id));
        assert_eq!(b.lineage_root_id, Some(a.id));
        assert_eq!(b.change_kind, ChangeKind::ManualEdit);
        Ok(())
    }

    #[test]
    fn new_lineage_then_plain_save_continues_newest_lineage() -> Result<()> {
        let mut store = migrated_store()?;
        let mut lineage = LineageManager::new(&mut store);
        lineage.save("A", SaveMode::Continue)?;
        lineage.save("B", SaveMode::Continue)?;
        let c = lineage.save("C", SaveMode::NewLineage)?;
        assert_eq!(c.version_number, 1);
        assert_eq!(c.parent_id, None);
        assert_eq!(c.lineage_root_id, Some(c.id));

        let d = lineage.save("D", SaveMode::Continue)?;
        assert_eq!(d.parent_id, Some(c.id));
        assert_eq!(d.lineage_root_id, Some(c.id));
        assert_eq!(d.version_number, 2);
        Ok(())
    }

    #[test]
    fn continue_lineage_targets_an_older_lineage() -> Result<()> {
        let mut store = migrated_store()?;
        let mut lineage = LineageManager::new(&mut store);
        let a = lineage.save("A", SaveMode::Continue)?;
        let b = lineage.save("B", SaveMode::Continue)?;
        lineage.save("C", SaveMode::NewLineage)?;

        let resumed = lineage.save("A v3", SaveMode::ContinueLineage(a.id))?;
        assert_eq!(resumed.parent_id, Some(b.id));
        assert_eq!(resumed.version_number, 3);
        assert_eq!(resumed.lineage_root_id, Some(a.id));

        assert!(matches!(
            lineage.save("nowhere", SaveMode::ContinueLineage(PromptId(9999))),
            Err(StoreError::NotFound { entity: "lineage", .. })
        ));
        Ok(())
    }

    #[test]
    fn blank_save_is_rejected_without_writing() -> Result<()> {
        let mut store = migrated_store()?;
        assert!(matches!(
            LineageManager::new(&mut store).save("   \n", SaveMode::Continue),
            Err(StoreError::Validation(ValidationError::EmptyContent))
        ));
        assert!(store.history(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn apply_methodology_writes_checkpoint_then_result() -> Result<()> {
        let mut store = migrated_store()?;
        let methodology = store.get_methodology_by_name("role_play")?;
        let mut progress_lines = Vec::new();
        let mut lineage = LineageManager::new(&mut store);
        let a = lineage.save("A", SaveMode::Continue)?;

        let mut transform = uppercase;
        let applied = lineage.apply_methodology(
            "draft text",
            &methodology,
            &mut transform,
            &mut |line: &str| progress_lines.push(line.to_string()),
        )?;

        let checkpoint = store.get_prompt(applied.parent_id.ok_or_else(|| anyhow!("no parent"))?)?;
        assert_eq!(checkpoint.content, "draft text");
        assert_eq!(checkpoint.change_kind, ChangeKind::ManualEdit);
        assert_eq!(checkpoint.parent_id, Some(a.id));
        assert_eq!(checkpoint.version_number, 2);

        assert_eq!(applied.content, "DRAFT TEXT");
        assert_eq!(applied.change_kind, ChangeKind::MethodologyApply);
        assert_eq!(applied.methodology_id, Some(methodology.id));
        assert_eq!(applied.version_number, 3);
        assert_eq!(applied.lineage_root_id, Some(a.id));
        assert_eq!(progress_lines, vec!["partial".to_string()]);
        Ok(())
    }

    #[test]
    fn apply_methodology_on_empty_store_checkpoints_an_initial_record() -> Result<()> {
        let mut store = migrated_store()?;
        let methodology = store.get_methodology_by_name("base64_encoding")?;
        let mut transform = uppercase;
        let applied = LineageManager::new(&mut store).apply_methodology(
            "hello",
            &methodology,
            &mut transform,
            &mut |_: &str| {},
        )?;
        let checkpoint = store.get_prompt(applied.parent_id.ok_or_else(|| anyhow!("no parent"))?)?;
        assert_eq!(checkpoint.change_kind, ChangeKind::Initial);
        assert_eq!(applied.version_number, 2);
        Ok(())
    }

    #[test]
    fn failing_transform_keeps_only_the_checkpoint() -> Result<()> {
        let mut store = migrated_store()?;
        let methodology = store.get_methodology_by_name("role_play")?;
        let mut lineage = LineageManager::new(&mut store);
        lineage.save("A", SaveMode::Continue)?;

        let mut failing = |_: &str,
                           _: &MethodologyRecord,
                           progress: &mut dyn FnMut(&str)|
         -> Result<String, TransformError> {
            progress("half an answer");
            Err(TransformError::Failed("provider unavailable".to_string()))
        };
        let result = lineage.apply_methodology("draft", &methodology, &mut failing, &mut |_: &str| {});
        assert!(matches!(result, Err(StoreError::TransformFailure(TransformError::Failed(_)))));

        let history = store.history(10)?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "draft");
        assert!(history.iter().all(|record| record.change_kind != ChangeKind::MethodologyApply));
        Ok(())
    }

    #[test]
    fn blank_transform_output_is_rejected() -> Result<()> {
        let mut store = migrated_store()?;
        let methodology = store.get_methodology_by_name("role_play")?;
        let mut blank = |_: &str,
                         _: &MethodologyRecord,
                         _: &mut dyn FnMut(&str)|
         -> Result<String, TransformError> { Ok("  ".to_string()) };
        let result = LineageManager::new(&mut store).apply_methodology(
            "draft",
            &methodology,
            &mut blank,
            &mut |_: &str| {},
        );
        assert!(matches!(result, Err(StoreError::Validation(ValidationError::EmptyContent))));
        assert_eq!(store.history(10)?.len(), 1);
        Ok(())
    }

    #[test]
    fn unknown_methodology_is_rejected_before_checkpoint() -> Result<()> {
        let mut store = migrated_store()?;
        let mut methodology = store.get_methodology_by_name("role_play")?;
        methodology.id = prompt_lineage_core::MethodologyId(9999);
        let mut transform = uppercase;
        let result = LineageManager::new(&mut store).apply_methodology(
            "draft",
            &methodology,
            &mut transform,
            &mut |_: &str| {},
        );
        assert!(matches!(result, Err(StoreError::NotFound { entity: "methodology", .. })));
        assert!(store.history(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn invariant_errors_name_the_broken_rule() {
        let err = StoreError::from(InvariantViolation::new(Invariant::LineageIdentity, "detail"));
        assert!(err.to_string().contains("lineage_identity"));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Save,
        NewLineage,
        ResumeFirst,
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => Just(Step::Save),
            1 => Just(Step::NewLineage),
            1 => Just(Step::ResumeFirst),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn every_lineage_is_a_contiguous_version_chain(steps in prop::collection::vec(step_strategy(), 1..24)) {
            let run = || -> Result<()> {
                let mut store = migrated_store()?;
                let mut lineage = LineageManager::new(&mut store);
                let mut first_root = None;
                for (index, step) in steps.iter().enumerate() {
                    let mode = match (step, first_root) {
                        (Step::NewLineage, _) => SaveMode::NewLineage,
                        (Step::ResumeFirst, Some(root)) => SaveMode::ContinueLineage(root),
                        _ => SaveMode::Continue,
                    };
                    let record = lineage.save(&format!("step {index}"), mode)?;
                    first_root.get_or_insert(record.effective_lineage_root());
                }

                for latest in store.latest_per_lineage()? {
                    let chain = store.by_lineage(latest.effective_lineage_root())?;
                    for (position, record) in chain.iter().enumerate() {
                        assert_eq!(record.version_number as usize, position + 1);
                        assert_eq!(record.lineage_root_id, Some(chain[0].id));
                        if position > 0 {
                            assert_eq!(record.parent_id, Some(chain[position - 1].id));
                        }
                    }
                    assert_eq!(latest.id, chain[chain.len() - 1].id);
                }
                assert!(store.integrity_check()?.lineage_issues.is_empty());
                Ok(())
            };
            prop_assert!(run().is_ok());
        }
    }
}
