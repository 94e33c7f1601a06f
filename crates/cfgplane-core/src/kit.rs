//! Request kit carried through every primitive call.
//!
//! A `Kit` names the caller (`user`), correlates logs and errors (`rid`) and
//! bounds every database round trip with an optional deadline.

use std::future::Future;
use std::time::Duration;

use cfgplane_store::StorageResult;
use tokio::time::Instant;

use crate::error::{Error, Result, StorageResultExt};

#[derive(Debug, Clone)]
pub struct Kit {
    /// Request correlation id
    pub rid: String,
    /// Operator on whose behalf rows are written
    pub user: String,
    pub deadline: Option<Instant>,
}

impl Kit {
    /// A kit with a fresh request id and no deadline.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            rid: uuid::Uuid::new_v4().to_string(),
            user: user.into(),
            deadline: None,
        }
    }

    pub fn with_rid(mut self, rid: impl Into<String>) -> Self {
        self.rid = rid.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Same request, fresh deadline. Used for work that must run after the
    /// caller's own budget may already be spent.
    pub fn renewed(&self, timeout: Duration) -> Self {
        self.clone().with_timeout(timeout)
    }

    /// Await `fut` under the deadline, leaving its output untouched.
    pub async fn within<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::DeadlineExceeded {
                    rid: self.rid.clone(),
                }),
            None => Ok(fut.await),
        }
    }

    /// Await a storage round trip under the deadline, tagging failures with
    /// the request id.
    pub async fn exec<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        self.within(fut).await?.for_kit(self)
    }
}
