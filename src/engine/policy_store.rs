/// In-memory view of the `threshold_policies` and `workflow_tiers` tables.
///
/// Loaded at startup and swapped wholesale after every admin upsert. Readers
/// take an `Arc<PolicyBook>` snapshot so one evaluation always sees a single
/// consistent version, even if a reload lands halfway through.
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::models::policy::PolicyBook;

#[derive(Clone, Default)]
pub struct PolicyStore(Arc<RwLock<Arc<PolicyBook>>>);

impl PolicyStore {
    pub fn new(book: PolicyBook) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(book))))
    }

    pub async fn snapshot(&self) -> Arc<PolicyBook> {
        self.0.read().await.clone()
    }

    /// Replace the whole book.
    pub async fn reload(&self, book: PolicyBook) {
        *self.0.write().await = Arc::new(book);
    }

    pub async fn is_populated(&self) -> bool {
        !self.0.read().await.policies().is_empty()
    }
}
