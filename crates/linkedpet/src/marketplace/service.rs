use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::domain::{
    Account, Actor, DocumentStatus, IllegalTransition, ListingKind, NewPublication, Owner,
    Publication, PublicationDraft, PublicationId, Request, RequestId, Role, TransactionStatus,
};
use super::payment::PaymentProcessor;
use super::store::{MarketplaceStore, OfferSearch, PublicationFilter, StoreError, UnitOfWork};
use crate::config::PaymentConfig;

/// Service running the publication/request workflow against a transactional
/// store and an external payment processor.
///
/// Operations are grouped by component: listing registry and queries here,
/// then `moderation`, `interest`, `acceptance` and `payment`.
pub struct MarketplaceService<S, P> {
    store: Arc<S>,
    pub(super) processor: Arc<P>,
    pub(super) payments: PaymentConfig,
}

impl<S, P> MarketplaceService<S, P>
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    pub fn new(store: Arc<S>, processor: Arc<P>, payments: PaymentConfig) -> Self {
        Self {
            store,
            processor,
            payments,
        }
    }

    pub fn payments(&self) -> &PaymentConfig {
        &self.payments
    }

    /// Runs `work` in a fresh unit of work: commit on success, rollback on error.
    pub(super) fn in_unit<'s, T, F>(
        &'s self,
        operation: &'static str,
        work: F,
    ) -> Result<T, WorkflowError>
    where
        F: FnOnce(&mut S::Unit<'s>) -> Result<T, WorkflowError>,
    {
        let mut unit = self.store.begin()?;
        match work(&mut unit) {
            Ok(value) => {
                unit.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = unit.rollback() {
                    warn!(operation, error = %rollback, "rollback failed");
                }
                debug!(operation, kind = err.kind().label(), error = %err, "operation aborted");
                Err(err)
            }
        }
    }

    /// Register a listing; it stays invisible to particulars until reviewed.
    pub fn create_publication(
        &self,
        actor: &Actor,
        draft: PublicationDraft,
    ) -> Result<Publication, WorkflowError> {
        self.in_unit("create_publication", |unit| {
            let account = resolve_lister(unit, actor)?;
            let owner = match account.role {
                Role::Shelter => Owner::Shelter(account.user_id),
                _ => Owner::Particular(account.user_id),
            };

            if draft.title.trim().is_empty() {
                return Err(WorkflowError::InvalidState(
                    "a publication needs a title".to_string(),
                ));
            }
            if draft.kind == ListingKind::Breeding {
                if account.role != Role::Particular {
                    return Err(WorkflowError::InvalidState(
                        "only particulars may list animals for sale".to_string(),
                    ));
                }
                if draft.price_cents.unwrap_or(0) == 0 {
                    return Err(WorkflowError::InvalidState(
                        "a breeding publication needs a price".to_string(),
                    ));
                }
            }

            let publication = unit.insert_publication(NewPublication {
                kind: draft.kind,
                owner,
                title: draft.title,
                animal: draft.animal,
                price_cents: draft.price_cents,
            })?;
            info!(publication = %publication.id, owner = %account.user_id, "publication registered");
            Ok(publication)
        })
    }

    pub fn publication(
        &self,
        actor: &Actor,
        publication_id: PublicationId,
    ) -> Result<Publication, WorkflowError> {
        self.in_unit("publication", |unit| {
            resolve_actor(unit, actor)?;
            unit.publication(publication_id)?
                .ok_or_else(|| WorkflowError::publication_not_found(publication_id))
        })
    }

    /// Moderator queue: every listing still waiting for document review.
    pub fn pending_publications(&self, actor: &Actor) -> Result<Vec<Publication>, WorkflowError> {
        self.in_unit("pending_publications", |unit| {
            require_role(unit, actor, Role::Moderator)?;
            let filter = PublicationFilter {
                document_status: Some(DocumentStatus::InRevision),
                ..PublicationFilter::default()
            };
            Ok(unit.publications(&filter)?)
        })
    }

    /// Verified listings open for interest, excluding the caller's own, narrowed
    /// by `search`.
    pub fn available_offers(
        &self,
        actor: &Actor,
        search: &OfferSearch,
    ) -> Result<Vec<Publication>, WorkflowError> {
        self.in_unit("available_offers", |unit| {
            resolve_lister(unit, actor)?;
            let filter = PublicationFilter {
                document_status: Some(DocumentStatus::Accepted),
                transaction_status: Some(TransactionStatus::InProgress),
                exclude_owner: Some(actor.user_id),
                search: search.clone(),
                ..PublicationFilter::default()
            };
            Ok(unit.publications(&filter)?)
        })
    }

    /// Every request on a publication; visible to its owner only.
    pub fn requests_for_publication(
        &self,
        actor: &Actor,
        publication_id: PublicationId,
    ) -> Result<Vec<Request>, WorkflowError> {
        self.in_unit("requests_for_publication", |unit| {
            resolve_lister(unit, actor)?;
            let publication = unit
                .publication(publication_id)?
                .filter(|publication| publication.owner.is(actor))
                .ok_or_else(|| WorkflowError::publication_not_found(publication_id))?;
            Ok(unit.requests_for_publication(publication.id)?)
        })
    }

    pub fn my_requests(&self, actor: &Actor) -> Result<Vec<Request>, WorkflowError> {
        self.in_unit("my_requests", |unit| {
            require_role(unit, actor, Role::Particular)?;
            Ok(unit.requests_by_particular(actor.user_id)?)
        })
    }
}

/// Looks up the caller's directory entry; unknown users and role mismatches are
/// both reported as not found.
pub(super) fn resolve_actor<U: UnitOfWork>(
    unit: &mut U,
    actor: &Actor,
) -> Result<Account, WorkflowError> {
    match unit.account(actor.user_id)? {
        Some(account) if account.role == actor.role => Ok(account),
        _ => Err(WorkflowError::NotFound(format!(
            "{} {} not found",
            actor.role.label(),
            actor.user_id
        ))),
    }
}

pub(super) fn require_role<U: UnitOfWork>(
    unit: &mut U,
    actor: &Actor,
    role: Role,
) -> Result<Account, WorkflowError> {
    if actor.role != role {
        return Err(WorkflowError::NotFound(format!(
            "{} {} not found",
            role.label(),
            actor.user_id
        )));
    }
    resolve_actor(unit, actor)
}

/// Particulars and shelters are the roles that own listings.
pub(super) fn resolve_lister<U: UnitOfWork>(
    unit: &mut U,
    actor: &Actor,
) -> Result<Account, WorkflowError> {
    match actor.role {
        Role::Particular | Role::Shelter => resolve_actor(unit, actor),
        _ => Err(WorkflowError::NotFound(format!(
            "owner {} not found",
            actor.user_id
        ))),
    }
}

pub(super) fn locked_publication<U: UnitOfWork>(
    unit: &mut U,
    publication_id: PublicationId,
) -> Result<Publication, WorkflowError> {
    unit.lock_publication(publication_id)?
        .ok_or_else(|| WorkflowError::publication_not_found(publication_id))
}

/// Locks the publication and checks the caller owns it. A foreign listing is
/// indistinguishable from a missing one.
pub(super) fn owned_publication<U: UnitOfWork>(
    unit: &mut U,
    actor: &Actor,
    publication_id: PublicationId,
) -> Result<Publication, WorkflowError> {
    let publication = locked_publication(unit, publication_id)?;
    if publication.owner.is(actor) {
        Ok(publication)
    } else {
        Err(WorkflowError::publication_not_found(publication_id))
    }
}

/// Machine-checkable category of a [`WorkflowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Conflict,
    UpstreamFailure,
    Internal,
}

impl ErrorKind {
    pub const fn label(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Conflict => "conflict",
            ErrorKind::UpstreamFailure => "upstream_failure",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Error raised by marketplace operations. Every variant aborts the unit of work.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    UpstreamFailure(String),
    #[error("internal failure: {0}")]
    Internal(#[source] StoreError),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::NotFound(_) => ErrorKind::NotFound,
            WorkflowError::InvalidState(_) => ErrorKind::InvalidState,
            WorkflowError::Conflict(_) => ErrorKind::Conflict,
            WorkflowError::UpstreamFailure(_) => ErrorKind::UpstreamFailure,
            WorkflowError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(super) fn publication_not_found(id: PublicationId) -> Self {
        WorkflowError::NotFound(format!("publication {id} not found"))
    }

    pub(super) fn request_not_found(id: RequestId) -> Self {
        WorkflowError::NotFound(format!("request {id} not found"))
    }
}

impl From<StoreError> for WorkflowError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Constraint(message) => WorkflowError::Conflict(message),
            other => WorkflowError::Internal(other),
        }
    }
}

impl From<IllegalTransition> for WorkflowError {
    fn from(value: IllegalTransition) -> Self {
        WorkflowError::InvalidState(value.to_string())
    }
}
