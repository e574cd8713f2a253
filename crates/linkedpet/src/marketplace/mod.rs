//! Publication and request workflow for the animal marketplace.
//!
//! Listings move through document review, interest, negotiation and payment.
//! Every operation runs inside one unit of work on a [`MarketplaceStore`];
//! calls to the external [`PaymentProcessor`] happen between units, never
//! while a publication row is locked.

pub mod acceptance;
pub mod domain;
pub mod interest;
pub mod memory;
pub mod moderation;
pub mod payment;
pub mod router;
pub mod service;
pub mod store;

#[cfg(test)]
mod tests;

pub use acceptance::AcceptanceOutcome;
pub use domain::{
    Account, Actor, AnimalDetails, DocumentStatus, IllegalTransition, ListingKind, NewPublication,
    NewRequest, Owner, Publication, PublicationDraft, PublicationId, Request, RequestId,
    RequestStatus, Role, TransactionStatus, UserId,
};
pub use memory::{MemoryStore, MemoryUnit};
pub use moderation::ReviewDecision;
pub use payment::{
    PaymentIntent, PaymentOutcome, PaymentProcessor, PaymentStatus, PayoutOutcome, PayoutReceipt,
    ProcessorError,
};
pub use router::{actor_from_headers, marketplace_router, USER_ID_HEADER, USER_ROLE_HEADER};
pub use service::{ErrorKind, MarketplaceService, WorkflowError};
pub use store::{MarketplaceStore, OfferSearch, PublicationFilter, StoreError, UnitOfWork};
