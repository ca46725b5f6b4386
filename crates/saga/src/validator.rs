//! Validation of reported step transitions against the store.
//!
//! Every status change of a step goes through [`StepValidator`] before it is
//! written. Checks run in a fixed order:
//!
//! 1. The parent chain of the step must not lead back to the step.
//! 2. With no stored record, any status is accepted.
//! 3. The same status is idempotent if the payload matches byte for byte,
//!    and rejected if it differs.
//! 4. A different status must be reachable from the stored one.

use std::collections::{HashMap, HashSet};

use step_store::{
    MessageId, SagaStepMetadata, SaveOptions, StepKey, StepStatus, StepStore, StepStoreError,
};

use crate::error::{SagaError, TransitionError};

/// A status change reported for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTransition {
    pub key: StepKey,
    pub parent_message_id: Option<MessageId>,
    pub status: StepStatus,
    pub payload: Vec<u8>,
}

impl StepTransition {
    pub fn new(
        key: StepKey,
        parent_message_id: Option<MessageId>,
        status: StepStatus,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            key,
            parent_message_id,
            status,
            payload,
        }
    }

    /// Moves an existing record to `status`, keeping its payload.
    pub fn of_record(record: &SagaStepMetadata, status: StepStatus) -> Self {
        Self::new(
            record.key(),
            record.parent_message_id,
            status,
            record.payload.clone(),
        )
    }
}

/// Validator decision for a [`StepTransition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionVerdict {
    /// Apply the transition.
    Valid,
    /// Already recorded exactly; nothing to do.
    Idempotent,
    DuplicateWithDifferentPayload,
    InvalidTransition { from: StepStatus, to: StepStatus },
    /// The message ids from the step back to itself.
    CircularChain { chain: Vec<MessageId> },
}

impl TransitionVerdict {
    /// Returns true for `Valid` and `Idempotent`.
    pub fn is_accepted(&self) -> bool {
        matches!(self, TransitionVerdict::Valid | TransitionVerdict::Idempotent)
    }

    /// Converts a rejection into its error.
    pub fn ensure_accepted(&self, transition: &StepTransition) -> Result<(), TransitionError> {
        match self {
            TransitionVerdict::Valid | TransitionVerdict::Idempotent => Ok(()),
            TransitionVerdict::DuplicateWithDifferentPayload => {
                Err(TransitionError::DuplicateWithDifferentPayload {
                    key: transition.key.clone(),
                    status: transition.status,
                })
            }
            TransitionVerdict::InvalidTransition { from, to } => {
                Err(TransitionError::InvalidTransition {
                    key: transition.key.clone(),
                    from: *from,
                    to: *to,
                })
            }
            TransitionVerdict::CircularChain { chain } => Err(TransitionError::CircularChain {
                key: transition.key.clone(),
                chain: chain.clone(),
            }),
        }
    }
}

/// A verdict together with the record it was computed against.
#[derive(Debug, Clone)]
pub struct Validation {
    pub verdict: TransitionVerdict,
    pub existing: Option<SagaStepMetadata>,
}

/// Checks step transitions against stored history.
#[derive(Debug, Clone, Copy)]
pub struct StepValidator {
    max_chain_depth: usize,
}

impl StepValidator {
    pub fn new(max_chain_depth: usize) -> Self {
        Self {
            max_chain_depth: max_chain_depth.max(1),
        }
    }

    /// Loads the stored record and validates against it.
    pub async fn validate<S: StepStore + ?Sized>(
        &self,
        store: &S,
        transition: &StepTransition,
    ) -> Result<Validation, StepStoreError> {
        let existing = store.get(&transition.key).await?;
        self.validate_with(store, transition, existing).await
    }

    /// Validates against a record the caller already loaded.
    ///
    /// Saga history is only read when the transition introduces a parent
    /// link the store does not already hold.
    pub async fn validate_with<S: StepStore + ?Sized>(
        &self,
        store: &S,
        transition: &StepTransition,
        existing: Option<SagaStepMetadata>,
    ) -> Result<Validation, StepStoreError> {
        let history = if Self::introduces_parent_link(transition, existing.as_ref()) {
            store.query_by_saga(transition.key.saga_id).await?
        } else {
            Vec::new()
        };
        let verdict = self.evaluate(transition, existing.as_ref(), &history);
        Ok(Validation { verdict, existing })
    }

    fn introduces_parent_link(
        transition: &StepTransition,
        existing: Option<&SagaStepMetadata>,
    ) -> bool {
        transition.parent_message_id.is_some()
            && existing.map(|record| record.parent_message_id) != Some(transition.parent_message_id)
    }

    /// Pure decision over a stored record and the saga's history.
    pub fn evaluate(
        &self,
        transition: &StepTransition,
        existing: Option<&SagaStepMetadata>,
        history: &[SagaStepMetadata],
    ) -> TransitionVerdict {
        if Self::introduces_parent_link(transition, existing) {
            if let Some(chain) = self.find_cycle(transition, history) {
                return TransitionVerdict::CircularChain { chain };
            }
        }

        let Some(existing) = existing else {
            return TransitionVerdict::Valid;
        };
        if existing.status == transition.status {
            if existing.payload == transition.payload {
                TransitionVerdict::Idempotent
            } else {
                TransitionVerdict::DuplicateWithDifferentPayload
            }
        } else if existing.status.can_transition_to(transition.status) {
            TransitionVerdict::Valid
        } else {
            TransitionVerdict::InvalidTransition {
                from: existing.status,
                to: transition.status,
            }
        }
    }

    /// Walks parent links from the transition's parent.
    ///
    /// A parent absent from the history ends the walk as a root. A walk
    /// longer than the configured depth is reported as a cycle.
    fn find_cycle(
        &self,
        transition: &StepTransition,
        history: &[SagaStepMetadata],
    ) -> Option<Vec<MessageId>> {
        let mut parents: HashMap<MessageId, Option<MessageId>> = HashMap::new();
        for step in history {
            parents
                .entry(step.message_id)
                .or_insert(step.parent_message_id);
        }

        let start = transition.key.message_id;
        let mut chain = vec![start];
        let mut visited = HashSet::from([start]);
        let mut current = transition.parent_message_id;

        while let Some(message_id) = current {
            chain.push(message_id);
            if !visited.insert(message_id) || chain.len() > self.max_chain_depth + 1 {
                return Some(chain);
            }
            current = parents.get(&message_id).copied().flatten();
        }
        None
    }
}

impl Default for StepValidator {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Validates a move of `record` to `status` and persists it.
///
/// The write is a compare-and-write against the status the validation saw,
/// so two racing writers cannot both apply a transition. Returns the record
/// as stored afterwards.
pub async fn record_transition<S: StepStore + ?Sized>(
    store: &S,
    validator: &StepValidator,
    record: &SagaStepMetadata,
    status: StepStatus,
) -> Result<SagaStepMetadata, SagaError> {
    let transition = StepTransition::of_record(record, status);
    let validation = validator.validate(store, &transition).await?;
    validation.verdict.ensure_accepted(&transition)?;

    match validation.existing {
        Some(current) if validation.verdict == TransitionVerdict::Idempotent => Ok(current),
        Some(current) => {
            let next = current.transitioned(status, transition.payload);
            match store
                .save(next.clone(), SaveOptions::expect_status(current.status))
                .await
            {
                Ok(()) => Ok(next),
                // A concurrent writer already recorded the same status.
                Err(StepStoreError::Conflict {
                    actual: Some(actual),
                    ..
                }) if actual == status => Ok(store.get(&next.key()).await?.unwrap_or(next)),
                Err(e) => Err(e.into()),
            }
        }
        None => {
            let next = SagaStepMetadata::new(
                transition.key,
                transition.parent_message_id,
                status,
                transition.payload,
            );
            store.save(next.clone(), SaveOptions::expect_new()).await?;
            Ok(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use step_store::{InMemoryStepStore, SagaId};

    fn record(
        saga_id: SagaId,
        message_id: MessageId,
        parent: Option<MessageId>,
        status: StepStatus,
    ) -> SagaStepMetadata {
        SagaStepMetadata::new(
            StepKey::new(saga_id, "ReserveStock", "InventoryHandler", message_id),
            parent,
            status,
            b"{\"sku\":\"A-1\"}".to_vec(),
        )
    }

    #[test]
    fn test_no_record_is_valid() {
        let validator = StepValidator::default();
        let transition = StepTransition::new(
            StepKey::new(SagaId::new(), "ReserveStock", "InventoryHandler", MessageId::new()),
            None,
            StepStatus::Completed,
            Vec::new(),
        );
        assert_eq!(
            validator.evaluate(&transition, None, &[]),
            TransitionVerdict::Valid
        );
    }

    #[test]
    fn test_same_status_same_payload_is_idempotent() {
        let validator = StepValidator::default();
        let stored = record(SagaId::new(), MessageId::new(), None, StepStatus::Completed);
        let transition = StepTransition::of_record(&stored, StepStatus::Completed);
        assert_eq!(
            validator.evaluate(&transition, Some(&stored), &[]),
            TransitionVerdict::Idempotent
        );
    }

    #[test]
    fn test_same_status_different_payload_is_rejected() {
        let validator = StepValidator::default();
        let stored = record(SagaId::new(), MessageId::new(), None, StepStatus::Completed);
        let mut transition = StepTransition::of_record(&stored, StepStatus::Completed);
        transition.payload = b"{\"sku\":\"B-2\"}".to_vec();

        let verdict = validator.evaluate(&transition, Some(&stored), &[]);
        assert_eq!(verdict, TransitionVerdict::DuplicateWithDifferentPayload);
        assert!(matches!(
            verdict.ensure_accepted(&transition),
            Err(TransitionError::DuplicateWithDifferentPayload {
                status: StepStatus::Completed,
                ..
            })
        ));
    }

    #[test]
    fn test_terminal_status_cannot_restart() {
        let validator = StepValidator::default();
        let stored = record(SagaId::new(), MessageId::new(), None, StepStatus::Compensated);
        let transition = StepTransition::of_record(&stored, StepStatus::Started);
        assert_eq!(
            validator.evaluate(&transition, Some(&stored), &[]),
            TransitionVerdict::InvalidTransition {
                from: StepStatus::Compensated,
                to: StepStatus::Started
            }
        );
    }

    #[test]
    fn test_allowed_transitions() {
        let validator = StepValidator::default();
        for (from, to) in [
            (StepStatus::Started, StepStatus::Completed),
            (StepStatus::Started, StepStatus::Failed),
            (StepStatus::Completed, StepStatus::Compensated),
            (StepStatus::Completed, StepStatus::CompensationFailed),
            (StepStatus::Failed, StepStatus::Compensated),
            (StepStatus::Started, StepStatus::Cancelled),
        ] {
            let stored = record(SagaId::new(), MessageId::new(), None, from);
            let transition = StepTransition::of_record(&stored, to);
            assert_eq!(
                validator.evaluate(&transition, Some(&stored), &[]),
                TransitionVerdict::Valid,
                "{from} -> {to}"
            );
        }
    }

    #[test]
    fn test_detects_circular_chain() {
        // A (root) <- B <- C, then a step for A claims C as its parent.
        let validator = StepValidator::default();
        let saga_id = SagaId::new();
        let (a, b, c) = (MessageId::new(), MessageId::new(), MessageId::new());
        let history = vec![
            record(saga_id, a, None, StepStatus::Completed),
            record(saga_id, b, Some(a), StepStatus::Completed),
            record(saga_id, c, Some(b), StepStatus::Started),
        ];
        let transition = StepTransition::new(
            StepKey::new(saga_id, "ReserveStock", "AuditHandler", a),
            Some(c),
            StepStatus::Started,
            Vec::new(),
        );

        let verdict = validator.evaluate(&transition, None, &history);
        assert_eq!(
            verdict,
            TransitionVerdict::CircularChain {
                chain: vec![a, c, b, a]
            }
        );
    }

    #[test]
    fn test_linear_chain_is_valid() {
        let validator = StepValidator::default();
        let saga_id = SagaId::new();
        let (a, b, c) = (MessageId::new(), MessageId::new(), MessageId::new());
        let history = vec![
            record(saga_id, a, None, StepStatus::Completed),
            record(saga_id, b, Some(a), StepStatus::Completed),
        ];
        let transition = StepTransition::new(
            StepKey::new(saga_id, "ProcessPayment", "PaymentHandler", c),
            Some(b),
            StepStatus::Started,
            Vec::new(),
        );
        assert_eq!(
            validator.evaluate(&transition, None, &history),
            TransitionVerdict::Valid
        );
    }

    #[test]
    fn test_unknown_parent_ends_chain() {
        let validator = StepValidator::default();
        let transition = StepTransition::new(
            StepKey::new(SagaId::new(), "ProcessPayment", "PaymentHandler", MessageId::new()),
            Some(MessageId::new()),
            StepStatus::Started,
            Vec::new(),
        );
        assert_eq!(
            validator.evaluate(&transition, None, &[]),
            TransitionVerdict::Valid
        );
    }

    #[test]
    fn test_chain_deeper_than_limit_is_rejected() {
        let validator = StepValidator::new(3);
        let saga_id = SagaId::new();
        let ids: Vec<MessageId> = (0..6).map(|_| MessageId::new()).collect();
        let history: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let parent = if i == 0 { None } else { Some(ids[i - 1]) };
                record(saga_id, *id, parent, StepStatus::Completed)
            })
            .collect();
        let transition = StepTransition::new(
            StepKey::new(saga_id, "ShipOrder", "ShippingHandler", MessageId::new()),
            Some(ids[5]),
            StepStatus::Started,
            Vec::new(),
        );
        assert!(matches!(
            validator.evaluate(&transition, None, &history),
            TransitionVerdict::CircularChain { .. }
        ));
    }

    #[tokio::test]
    async fn test_record_transition_applies_and_is_idempotent() {
        let store = InMemoryStepStore::new();
        let validator = StepValidator::default();
        let started = record(SagaId::new(), MessageId::new(), None, StepStatus::Started);
        store
            .save(started.clone(), SaveOptions::expect_new())
            .await
            .unwrap();

        let completed = record_transition(&store, &validator, &started, StepStatus::Completed)
            .await
            .unwrap();
        assert_eq!(completed.status, StepStatus::Completed);

        let again = record_transition(&store, &validator, &started, StepStatus::Completed)
            .await
            .unwrap();
        assert_eq!(again.status, StepStatus::Completed);
        assert_eq!(store.step_count().await, 1);
    }

    #[tokio::test]
    async fn test_record_transition_rejects_invalid_move() {
        let store = InMemoryStepStore::new();
        let validator = StepValidator::default();
        let compensated = record(SagaId::new(), MessageId::new(), None, StepStatus::Compensated);
        store
            .save(compensated.clone(), SaveOptions::expect_new())
            .await
            .unwrap();

        let result =
            record_transition(&store, &validator, &compensated, StepStatus::Completed).await;
        assert!(matches!(
            result,
            Err(SagaError::Transition(TransitionError::InvalidTransition { .. }))
        ));
    }
}
