use serde::Deserialize;

use super::domain::{
    Account, AnimalDetails, DocumentStatus, NewPublication, NewRequest, Publication, PublicationId, Request,
    RequestId, TransactionStatus, UserId,
};

/// Transactional storage the workflow runs against.
///
/// Every marketplace operation opens one unit of work, performs its reads and
/// writes through it, and either commits or rolls back. Nothing written through a
/// unit is visible to other units before `commit`.
pub trait MarketplaceStore: Send + Sync {
    type Unit<'a>: UnitOfWork
    where
        Self: 'a;

    fn begin(&self) -> Result<Self::Unit<'_>, StoreError>;
}

/// One isolated, all-or-nothing sequence of reads and writes.
///
/// Dropping a unit without committing discards its writes and releases its locks.
pub trait UnitOfWork {
    fn account(&mut self, id: UserId) -> Result<Option<Account>, StoreError>;

    fn publication(&mut self, id: PublicationId) -> Result<Option<Publication>, StoreError>;

    /// Reads the publication and holds an exclusive row lock on it until the
    /// unit ends (`SELECT ... FOR UPDATE`).
    fn lock_publication(&mut self, id: PublicationId) -> Result<Option<Publication>, StoreError>;

    fn publications(&mut self, filter: &PublicationFilter)
        -> Result<Vec<Publication>, StoreError>;

    fn insert_publication(&mut self, row: NewPublication) -> Result<Publication, StoreError>;

    /// Writes the row, taking its lock first when the unit does not hold it yet.
    fn update_publication(&mut self, publication: &Publication) -> Result<(), StoreError>;

    fn request(&mut self, id: RequestId) -> Result<Option<Request>, StoreError>;

    fn request_for(
        &mut self,
        publication_id: PublicationId,
        particular_id: UserId,
    ) -> Result<Option<Request>, StoreError>;

    fn requests_for_publication(
        &mut self,
        publication_id: PublicationId,
    ) -> Result<Vec<Request>, StoreError>;

    fn requests_by_particular(&mut self, particular_id: UserId)
        -> Result<Vec<Request>, StoreError>;

    fn insert_request(&mut self, row: NewRequest) -> Result<Request, StoreError>;

    fn update_request(&mut self, request: &Request) -> Result<(), StoreError>;

    fn delete_request(&mut self, id: RequestId) -> Result<(), StoreError>;

    fn commit(self) -> Result<(), StoreError>;

    fn rollback(self) -> Result<(), StoreError>;
}

/// Predicate for listing queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicationFilter {
    pub document_status: Option<DocumentStatus>,
    pub transaction_status: Option<TransactionStatus>,
    pub owner: Option<UserId>,
    pub exclude_owner: Option<UserId>,
    pub search: OfferSearch,
}

impl PublicationFilter {
    pub fn matches(&self, publication: &Publication) -> bool {
        let owner = publication.owner.user_id();
        self.document_status
            .map_or(true, |status| publication.document_status == status)
            && self
                .transaction_status
                .map_or(true, |status| publication.transaction_status == Some(status))
            && self.owner.map_or(true, |id| owner == id)
            && self.exclude_owner.map_or(true, |id| owner != id)
            && self.search.matches(&publication.animal)
    }
}

/// Optional narrowing of the offers a particular browses. Text fields match
/// case-insensitive substrings; age and pedigree must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OfferSearch {
    pub location: Option<String>,
    #[serde(rename = "type")]
    pub species: Option<String>,
    pub breed: Option<String>,
    #[serde(rename = "age")]
    pub age_months: Option<u16>,
    pub pedigree: Option<bool>,
}

impl OfferSearch {
    pub fn matches(&self, animal: &AnimalDetails) -> bool {
        contains(&animal.location, &self.location)
            && contains(&animal.species, &self.species)
            && contains(&animal.breed, &self.breed)
            && self
                .age_months
                .map_or(true, |age| animal.age_months == Some(age))
            && self
                .pedigree
                .map_or(true, |pedigree| animal.pedigree == Some(pedigree))
    }
}

fn contains(value: &Option<String>, needle: &Option<String>) -> bool {
    match needle.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(needle) => value
            .as_deref()
            .is_some_and(|value| value.to_lowercase().contains(&needle.to_lowercase())),
    }
}


/// Error enumeration for store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("record not found")]
    NotFound,
    #[error("timed out waiting for lock on publication {0}")]
    LockTimeout(PublicationId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
