//! Caller identity carried across the bus.
//!
//! A dispatched envelope snapshots the caller's claims. On the consuming side
//! the claims are rebuilt into an [`Identity`] that the handler receives in its
//! [`CallContext`](crate::exchange::CallContext), and that is also installed as
//! the ambient identity of the handler's task via [`scope`]. Anything the
//! handler dispatches in turn carries the same identity forward.
//!
//! The ambient identity is task-local, so concurrently handled messages never
//! see each other's callers.

use std::future::Future;

use serde::{Deserialize, Serialize};

tokio::task_local! {
    static CURRENT_IDENTITY: Option<Identity>;
}

/// Claim type conventionally used for roles.
pub const ROLE_CLAIM: &str = "role";

/// Claim type conventionally used for the subject / user id.
pub const NAME_CLAIM: &str = "name";

/// A single `(type, value)` claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Claim {
    pub claim_type: String,
    pub value: String,
}

impl Claim {
    pub fn new(claim_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
        }
    }
}

/// An ordered set of claims describing who is calling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    claims: Vec<Claim>,
}

impl Identity {
    /// Create an identity with no claims.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an identity from a wire snapshot, preserving order.
    pub fn from_claims(claims: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            claims: claims
                .into_iter()
                .map(|(claim_type, value)| Claim { claim_type, value })
                .collect(),
        }
    }

    /// Add a claim (builder style).
    pub fn with_claim(mut self, claim_type: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.push(Claim::new(claim_type, value));
        self
    }

    /// Snapshot the claims as ordered `(type, value)` pairs.
    pub fn to_claims(&self) -> Vec<(String, String)> {
        self.claims
            .iter()
            .map(|c| (c.claim_type.clone(), c.value.clone()))
            .collect()
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    /// First value for a claim type.
    pub fn claim(&self, claim_type: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|c| c.claim_type == claim_type)
            .map(|c| c.value.as_str())
    }

    /// Whether the exact `(type, value)` claim is present.
    pub fn has_claim(&self, claim_type: &str, value: &str) -> bool {
        self.claims
            .iter()
            .any(|c| c.claim_type == claim_type && c.value == value)
    }

    pub fn name(&self) -> Option<&str> {
        self.claim(NAME_CLAIM)
    }

    pub fn is_in_role(&self, role: &str) -> bool {
        self.has_claim(ROLE_CLAIM, role)
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

/// Run `fut` with `identity` installed as the ambient caller identity.
pub async fn scope<F>(identity: Option<Identity>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_IDENTITY.scope(identity, fut).await
}

/// The ambient caller identity of the current task, if any.
pub fn current() -> Option<Identity> {
    CURRENT_IDENTITY
        .try_with(|identity| identity.clone())
        .ok()
        .flatten()
}
