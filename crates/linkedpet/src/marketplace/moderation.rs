use serde::{Deserialize, Serialize};
use tracing::info;

use super::domain::{Actor, DocumentStatus, Publication, PublicationId, Role, TransactionStatus};
use super::payment::PaymentProcessor;
use super::service::{locked_publication, require_role, MarketplaceService, WorkflowError};
use super::store::{MarketplaceStore, UnitOfWork};

/// Moderator verdict on a listing's documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Accept,
    Reject,
}

impl ReviewDecision {
    pub const fn document_status(self) -> DocumentStatus {
        match self {
            ReviewDecision::Accept => DocumentStatus::Accepted,
            ReviewDecision::Reject => DocumentStatus::Rejected,
        }
    }
}

impl<S, P> MarketplaceService<S, P>
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    /// Decide a listing still in revision. Approval opens it for interest.
    pub fn review_publication(
        &self,
        actor: &Actor,
        publication_id: PublicationId,
        decision: ReviewDecision,
    ) -> Result<Publication, WorkflowError> {
        self.in_unit("review_publication", |unit| {
            require_role(unit, actor, Role::Moderator)?;
            let mut publication = locked_publication(unit, publication_id)?;

            if publication.document_status != DocumentStatus::InRevision {
                return Err(WorkflowError::InvalidState(format!(
                    "publication {publication_id} was already reviewed ({})",
                    publication.document_status.label()
                )));
            }

            publication.document_status = decision.document_status();
            if decision == ReviewDecision::Accept {
                publication.advance(TransactionStatus::InProgress)?;
            }
            unit.update_publication(&publication)?;

            info!(
                publication = %publication_id,
                moderator = %actor.user_id,
                status = publication.document_status.label(),
                "publication reviewed"
            );
            Ok(publication)
        })
    }
}
