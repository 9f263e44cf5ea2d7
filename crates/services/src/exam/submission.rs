use std::collections::BTreeMap;

use exam_core::model::{Part, QuestionId};
use exam_core::session::{PartUpload, SubmissionPlan};

use crate::capabilities::SubmissionGateway;
use crate::error::SubmissionError;

/// What the backend acknowledged for one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub part: Part,
    pub uploaded: Vec<QuestionId>,
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionReport {
    pub parts: Vec<PartReceipt>,
}

impl SubmissionReport {
    #[must_use]
    pub fn uploaded_count(&self) -> usize {
        self.parts.iter().map(|p| p.uploaded.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Run the upload protocol part by part.
///
/// Parts go strictly 1 → 2 → 3 and each part finishes all three steps before
/// the next one starts. The first failure aborts everything.
///
/// # Errors
///
/// Returns `SubmissionError` naming the part (and question) that failed.
pub async fn submit_plan(
    gateway: &dyn SubmissionGateway,
    plan: &SubmissionPlan,
) -> Result<SubmissionReport, SubmissionError> {
    let mut report = SubmissionReport::default();
    for upload in &plan.parts {
        if upload.recordings.is_empty() {
            continue;
        }
        let receipt = submit_part(gateway, plan, upload).await?;
        report.parts.push(receipt);
    }
    Ok(report)
}

async fn submit_part(
    gateway: &dyn SubmissionGateway,
    plan: &SubmissionPlan,
    upload: &PartUpload,
) -> Result<PartReceipt, SubmissionError> {
    let part = upload.part;
    let question_ids: Vec<QuestionId> = upload.recordings.iter().map(|r| r.question_id).collect();

    let targets = gateway
        .request_upload_targets(&plan.session_id, part, &question_ids)
        .await
        .map_err(|source| SubmissionError::RequestTargets { part, source })?;
    if targets.is_empty() {
        return Err(SubmissionError::NoTargets { part });
    }

    let mut storage_paths = BTreeMap::new();
    for recording in &upload.recordings {
        let question_id = recording.question_id;
        let target = targets
            .get(&question_id)
            .ok_or(SubmissionError::MissingTarget { part, question_id })?;
        gateway
            .transfer(target, &recording.audio)
            .await
            .map_err(|source| SubmissionError::Transfer {
                part,
                question_id,
                source,
            })?;
        tracing::debug!(%question_id, part = part.key(), "answer uploaded");
        storage_paths.insert(question_id, target.storage_path.clone());
    }

    gateway
        .confirm(&plan.session_id, part, &storage_paths)
        .await
        .map_err(|source| SubmissionError::Confirm { part, source })?;
    tracing::info!(
        session_id = %plan.session_id,
        part = part.key(),
        answers = storage_paths.len(),
        "part upload confirmed"
    );

    Ok(PartReceipt {
        part,
        uploaded: question_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::{CallLog, InMemoryGateway};
    use exam_core::model::{AudioResource, AudioUri, Recording, SessionId};

    fn recording(id: u64, part: Part) -> Recording {
        Recording {
            question_id: QuestionId::new(id),
            part,
            audio: AudioResource::new(
                format!("h{id}"),
                AudioUri::from_file(format!("/tmp/{id}.m4a")).unwrap(),
            )
            .unwrap(),
            duration_secs: 3,
        }
    }

    fn plan(parts: Vec<(Part, Vec<u64>)>) -> SubmissionPlan {
        SubmissionPlan {
            session_id: SessionId::from(77_u64),
            parts: parts
                .into_iter()
                .map(|(part, ids)| PartUpload {
                    part,
                    recordings: ids.into_iter().map(|id| recording(id, part)).collect(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn parts_run_strictly_in_sequence() {
        let log = CallLog::new();
        let gateway = InMemoryGateway::new().with_log(log.clone());
        let plan = plan(vec![(Part::One, vec![10, 11]), (Part::Three, vec![30])]);

        let report = submit_plan(&gateway, &plan).await.unwrap();

        assert_eq!(
            log.entries(),
            vec![
                "gateway:targets:part1:10,11",
                "gateway:transfer:77/part1/10.m4a",
                "gateway:transfer:77/part1/11.m4a",
                "gateway:confirm:part1",
                "gateway:targets:part3:30",
                "gateway:transfer:77/part3/30.m4a",
                "gateway:confirm:part3",
            ]
        );
        assert_eq!(report.uploaded_count(), 3);
        assert!(log.filtered("gateway:targets:part2").is_empty());
    }

    #[tokio::test]
    async fn transfer_failure_names_question_and_skips_confirm() {
        let log = CallLog::new();
        let gateway = InMemoryGateway::new().with_log(log.clone());
        gateway.fail_transfer_for(Some(QuestionId::new(11)));
        let plan = plan(vec![(Part::One, vec![10, 11]), (Part::Two, vec![20])]);

        let err = submit_plan(&gateway, &plan).await.unwrap_err();

        assert!(matches!(
            err,
            SubmissionError::Transfer { question_id, .. } if question_id == QuestionId::new(11)
        ));
        assert!(log.filtered("gateway:confirm").is_empty());
        assert!(log.filtered("gateway:targets:part2").is_empty());
    }

    #[tokio::test]
    async fn empty_target_map_fails_the_part() {
        let gateway = InMemoryGateway::new();
        gateway.return_no_targets_for(Some(Part::Three));
        let plan = plan(vec![(Part::One, vec![10]), (Part::Three, vec![30])]);

        let err = submit_plan(&gateway, &plan).await.unwrap_err();

        assert!(matches!(err, SubmissionError::NoTargets { part: Part::Three }));
        // Part 1 had already been confirmed; the caller resubmits everything anyway.
        assert_eq!(gateway.confirmed().len(), 1);
    }

    #[tokio::test]
    async fn confirm_failure_is_reported_per_part() {
        let gateway = InMemoryGateway::new();
        gateway.fail_confirm_for(Some(Part::One));
        let err = submit_plan(&gateway, &plan(vec![(Part::One, vec![10])]))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmissionError::Confirm { part: Part::One, .. }));
    }
}
