//! Change planner: decides which descriptors run, and in which order.

use std::collections::{HashMap, HashSet};

use crate::descriptor::Descriptor;
use crate::error::PlanningError;
use crate::ledger::MigrationRecord;

/// Computes the pending descriptors, ordered by ascending id.
///
/// Every descriptor is validated and ids must be unique, regardless of
/// whether they are pending. With `verify_checksums`, applied descriptors
/// must still match the checksum recorded when they ran.
pub fn plan<'a>(
    descriptors: &'a [Descriptor],
    applied: &[MigrationRecord],
    verify_checksums: bool,
) -> Result<Vec<&'a Descriptor>, PlanningError> {
    let mut by_id: HashMap<&str, &Descriptor> = HashMap::with_capacity(descriptors.len());
    for descriptor in descriptors {
        descriptor.validate()?;
        if let Some(first) = by_id.insert(descriptor.id(), descriptor) {
            return Err(PlanningError::DuplicateId {
                id: descriptor.id().to_string(),
                first: first.name().to_string(),
                second: descriptor.name().to_string(),
            });
        }
    }

    let mut applied_ids: HashSet<&str> = HashSet::with_capacity(applied.len());
    for record in applied {
        applied_ids.insert(record.id.as_str());
        match by_id.get(record.id.as_str()) {
            Some(descriptor) if verify_checksums => {
                let found = descriptor.checksum();
                if found != record.checksum {
                    return Err(PlanningError::ChecksumMismatch {
                        id: record.id.clone(),
                        name: record.name.clone(),
                        recorded: record.checksum.clone(),
                        found,
                    });
                }
            }
            Some(_) => {}
            None => {
                log::warn!(
                    "Ledger entry {} ({}) has no matching descriptor",
                    record.id,
                    record.name
                );
            }
        }
    }

    let mut pending: Vec<&Descriptor> = descriptors
        .iter()
        .filter(|d| !applied_ids.contains(d.id()))
        .collect();
    pending.sort_by(|a, b| a.id().cmp(b.id()));
    Ok(pending)
}

/// Ledger records whose descriptor is no longer defined.
pub fn orphans<'a>(
    descriptors: &[Descriptor],
    applied: &'a [MigrationRecord],
) -> Vec<&'a MigrationRecord> {
    let known: HashSet<&str> = descriptors.iter().map(|d| d.id()).collect();
    applied
        .iter()
        .filter(|r| !known.contains(r.id.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    fn descriptor(id: &str, name: &str) -> Descriptor {
        Descriptor::new(id, name).up(Operation::drop_table(format!("legacy_{name}")))
    }

    fn record(descriptor: &Descriptor, batch: i64) -> MigrationRecord {
        MigrationRecord::new(descriptor, batch)
    }

    #[test]
    fn pending_are_sorted_by_id_regardless_of_input_order() {
        let descriptors = vec![
            descriptor("2023_03_01_000000", "c"),
            descriptor("2023_01_01_000000", "a"),
            descriptor("2023_02_01_000000", "b"),
        ];
        let pending = plan(&descriptors, &[], true).unwrap();
        let ids: Vec<&str> = pending.iter().map(|d| d.id()).collect();
        assert_eq!(
            ids,
            vec!["2023_01_01_000000", "2023_02_01_000000", "2023_03_01_000000"]
        );
    }

    #[test]
    fn applied_descriptors_are_excluded() {
        let descriptors = vec![
            descriptor("2023_01_01_000000", "a"),
            descriptor("2023_02_01_000000", "b"),
        ];
        let applied = vec![record(&descriptors[0], 1)];
        let pending = plan(&descriptors, &applied, true).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), "2023_02_01_000000");
    }

    #[test]
    fn duplicate_ids_are_fatal() {
        let descriptors = vec![
            descriptor("2023_06_01_000000", "create_discount_condition_translations_table"),
            descriptor("2023_06_01_000000", "create_discount_condition_translations_table_v2"),
        ];
        let err = plan(&descriptors, &[], true).unwrap_err();
        assert!(matches!(err, PlanningError::DuplicateId { ref id, .. } if id == "2023_06_01_000000"));
    }

    #[test]
    fn duplicate_ids_are_fatal_even_when_applied() {
        let descriptors = vec![
            descriptor("2023_06_01_000000", "x"),
            descriptor("2023_06_01_000000", "y"),
        ];
        let applied = vec![record(&descriptors[0], 1)];
        assert!(plan(&descriptors, &applied, true).is_err());
    }

    #[test]
    fn edited_descriptor_is_rejected_when_verifying() {
        let original = descriptor("2023_01_01_000000", "a");
        let applied = vec![record(&original, 1)];
        let edited = vec![
            Descriptor::new("2023_01_01_000000", "a").up(Operation::drop_table("something_else")),
        ];

        let err = plan(&edited, &applied, true).unwrap_err();
        assert!(matches!(err, PlanningError::ChecksumMismatch { .. }));

        let pending = plan(&edited, &applied, false).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn orphans_are_reported_not_fatal() {
        let gone = descriptor("2022_12_01_000000", "removed");
        let kept = descriptor("2023_01_01_000000", "kept");
        let applied = vec![record(&gone, 1), record(&kept, 1)];
        let descriptors = vec![kept.clone()];

        assert!(plan(&descriptors, &applied, true).unwrap().is_empty());
        let orphaned = orphans(&descriptors, &applied);
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].id, "2022_12_01_000000");
    }

    #[test]
    fn invalid_descriptor_is_a_planning_error() {
        let descriptors = vec![Descriptor::new("", "nameless")];
        let err = plan(&descriptors, &[], true).unwrap_err();
        assert!(matches!(err, PlanningError::InvalidDescriptor(_)));
    }
}
