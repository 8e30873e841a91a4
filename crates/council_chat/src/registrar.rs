//! Advisor identity registrar.
//!
//! Creates advisors with handles that are unique within their owner's
//! namespace, links them to their creator, and manages which advisors a user
//! has selected into their council.
//!
//! Handles are allocated with a generate-and-check loop: `ceo-coach`,
//! `ceo-coach-2`, `ceo-coach-3`, ... with every candidate re-checked against
//! storage. Allocation for one owner is serialized in-process, which closes the
//! race for a single server but not across several writers sharing a store.

use std::sync::Arc;

use council_core::{
    Advisor, AdvisorStatus, Clock, LinkSource, Persona, Repository, UserAdvisorLink,
    ACTION_CREATE_ADVISOR,
};
use council_guard::{AuthContext, IdempotencyStore, KeyedLocks, OwnershipGuard, RateLimiter};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::slug::{base_handle, handle_candidate};

/// Fields a caller supplies to create an advisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorPayload {
    pub name: String,
    pub one_liner: String,
    pub mission: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub scope_in: Vec<String>,
    #[serde(default)]
    pub scope_out: Vec<String>,
    #[serde(default)]
    pub persona: Option<Persona>,
}

impl AdvisorPayload {
    pub fn new(
        name: impl Into<String>,
        one_liner: impl Into<String>,
        mission: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            one_liner: one_liner.into(),
            mission: mission.into(),
            tags: Vec::new(),
            scope_in: Vec::new(),
            scope_out: Vec::new(),
            persona: None,
        }
    }

    pub fn validate(&self) -> ChatResult<()> {
        for (field, value) in [
            ("name", &self.name),
            ("oneLiner", &self.one_liner),
            ("mission", &self.mission),
        ] {
            if value.trim().is_empty() {
                return Err(ChatError::InvalidPayload(format!("{} must not be empty", field)));
            }
        }
        if let Some(persona) = &self.persona {
            persona.validate()?;
        }
        Ok(())
    }
}

/// Result of a successful creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedAdvisor {
    pub advisor_id: String,
    pub handle: String,
}

/// Creates and links advisor identities.
pub struct IdentityRegistrar {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    guard: OwnershipGuard,
    limiter: Arc<RateLimiter>,
    idempotency: Arc<IdempotencyStore>,
    owner_locks: KeyedLocks,
    max_attempts: u32,
}

impl IdentityRegistrar {
    pub fn new(
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        limiter: Arc<RateLimiter>,
        idempotency: Arc<IdempotencyStore>,
        max_attempts: u32,
    ) -> Self {
        Self {
            guard: OwnershipGuard::new(repo.clone()),
            repo,
            clock,
            limiter,
            idempotency,
            owner_locks: KeyedLocks::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create an advisor owned by the caller.
    pub async fn create(
        &self,
        caller: &AuthContext,
        payload: AdvisorPayload,
    ) -> ChatResult<CreatedAdvisor> {
        let owner_id = caller.require_user()?;
        payload.validate()?;
        self.limiter.enforce(owner_id, ACTION_CREATE_ADVISOR).await?;
        self.insert(owner_id, payload).await
    }

    /// Create an advisor, replaying the stored result when `key` was seen before.
    pub async fn create_with_key(
        &self,
        caller: &AuthContext,
        key: Option<&str>,
        payload: AdvisorPayload,
    ) -> ChatResult<CreatedAdvisor> {
        let owner_id = caller.require_user()?;
        match key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => {
                let scoped = format!("{}:{}:{}", ACTION_CREATE_ADVISOR, owner_id, key);
                self.idempotency
                    .get_or_compute(&scoped, || self.create(caller, payload))
                    .await
            }
            None => self.create(caller, payload).await,
        }
    }

    async fn insert(&self, owner_id: &str, payload: AdvisorPayload) -> ChatResult<CreatedAdvisor> {
        let _owner = self.owner_locks.lock(owner_id).await;

        let handle = self.allocate_handle(owner_id, &payload.name).await?;
        let now = self.clock.now();
        let advisor = Advisor {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: payload.name.trim().to_string(),
            handle: handle.clone(),
            one_liner: payload.one_liner.trim().to_string(),
            mission: payload.mission.trim().to_string(),
            tags: payload.tags,
            scope_in: payload.scope_in,
            scope_out: payload.scope_out,
            persona: payload.persona,
            status: AdvisorStatus::Active,
            created_at: now,
        };
        let advisor_id = advisor.id.clone();
        self.repo.insert_advisor(advisor).await?;

        let link = UserAdvisorLink {
            user_id: owner_id.to_string(),
            advisor_id: advisor_id.clone(),
            source: LinkSource::Created,
            team_key: None,
            created_at: now,
        };
        if let Err(e) = self.repo.insert_link(link).await {
            // Undo the advisor row so no unlinked advisor stays visible
            if let Err(cleanup) = self.repo.delete_advisor(&advisor_id).await {
                error!(
                    "Failed to remove advisor {} after link failure: {}",
                    advisor_id, cleanup
                );
            }
            return Err(e.into());
        }

        info!("Created advisor {} (@{}) for {}", advisor_id, handle, owner_id);
        Ok(CreatedAdvisor { advisor_id, handle })
    }

    async fn allocate_handle(&self, owner_id: &str, name: &str) -> ChatResult<String> {
        let base = base_handle(name);
        for attempt in 1..=self.max_attempts {
            let candidate = handle_candidate(&base, attempt);
            if self
                .repo
                .find_advisor_by_handle(owner_id, &candidate)
                .await?
                .is_none()
            {
                return Ok(candidate);
            }
        }
        Err(ChatError::Conflict(format!(
            "no free handle for '{}' after {} attempts",
            base, self.max_attempts
        )))
    }

    /// Advisors owned by the caller, oldest first.
    pub async fn list_owned(&self, caller: &AuthContext) -> ChatResult<Vec<Advisor>> {
        let owner_id = caller.require_user()?;
        Ok(self.repo.list_advisors_by_owner(owner_id).await?)
    }

    pub async fn get(&self, caller: &AuthContext, advisor_id: &str) -> ChatResult<Advisor> {
        Ok(self.guard.validate_advisor_ownership(advisor_id, caller).await?)
    }

    /// Archive an owned advisor. Archived advisors no longer answer mentions.
    pub async fn archive(&self, caller: &AuthContext, advisor_id: &str) -> ChatResult<Advisor> {
        let mut advisor = self.guard.validate_advisor_ownership(advisor_id, caller).await?;
        if advisor.status != AdvisorStatus::Archived {
            advisor.status = AdvisorStatus::Archived;
            self.repo.update_advisor(advisor.clone()).await?;
            info!("Archived advisor {}", advisor_id);
        }
        Ok(advisor)
    }

    /// Add an active advisor to the caller's council. Selecting twice is a no-op.
    pub async fn select(
        &self,
        caller: &AuthContext,
        advisor_id: &str,
        team_key: Option<String>,
    ) -> ChatResult<bool> {
        let user_id = caller.require_user()?;
        let advisor = self
            .repo
            .get_advisor(advisor_id)
            .await?
            .filter(Advisor::is_active)
            .ok_or_else(|| council_core::CoreError::not_found("Advisor", advisor_id))?;

        let source = if team_key.is_some() {
            LinkSource::Team
        } else {
            LinkSource::Selected
        };
        let inserted = self
            .repo
            .insert_link(UserAdvisorLink {
                user_id: user_id.to_string(),
                advisor_id: advisor.id,
                source,
                team_key,
                created_at: self.clock.now(),
            })
            .await?;
        Ok(inserted)
    }

    /// Remove an advisor from the caller's council.
    pub async fn unselect(&self, caller: &AuthContext, advisor_id: &str) -> ChatResult<bool> {
        let user_id = caller.require_user()?;
        Ok(self.repo.delete_link(user_id, advisor_id).await?)
    }

    /// The caller's active advisor set, in selection order.
    pub async fn selected_advisors(&self, caller: &AuthContext) -> ChatResult<Vec<Advisor>> {
        let user_id = caller.require_user()?;
        let mut advisors = Vec::new();
        for link in self.repo.list_links(user_id).await? {
            if let Some(advisor) = self.repo.get_advisor(&link.advisor_id).await? {
                if advisor.is_active() {
                    advisors.push(advisor);
                }
            }
        }
        Ok(advisors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use council_core::{ArenaRepository, CouncilConfig, ErrorCode, ManualClock, RateLimitRule};
    use std::collections::HashSet;

    struct Fixture {
        repo: Arc<ArenaRepository>,
        registrar: IdentityRegistrar,
    }

    fn fixture_with_limit(limit: u32) -> Fixture {
        let repo = Arc::new(ArenaRepository::new());
        let clock: Arc<ManualClock> = Arc::new(ManualClock::default());
        let limiter = Arc::new(
            RateLimiter::new(repo.clone(), clock.clone(), &CouncilConfig::default())
                .with_rule(ACTION_CREATE_ADVISOR, RateLimitRule::new(limit, 3600)),
        );
        let idempotency = Arc::new(IdempotencyStore::new(
            repo.clone(),
            clock.clone(),
            Duration::hours(1),
        ));
        let registrar = IdentityRegistrar::new(repo.clone(), clock, limiter, idempotency, 50);
        Fixture { repo, registrar }
    }

    fn fixture() -> Fixture {
        fixture_with_limit(100)
    }

    fn coach() -> AdvisorPayload {
        AdvisorPayload::new("CEO Coach", "Sharpens your leadership", "Help founders lead")
    }

    #[tokio::test]
    async fn test_sequential_handles() {
        let f = fixture();
        let caller = AuthContext::user("u1");

        let first = f.registrar.create(&caller, coach()).await.unwrap();
        let second = f.registrar.create(&caller, coach()).await.unwrap();

        assert_eq!(first.handle, "ceo-coach");
        assert_eq!(second.handle, "ceo-coach-2");
        assert_ne!(first.advisor_id, second.advisor_id);
    }

    #[tokio::test]
    async fn test_handles_scoped_per_owner() {
        let f = fixture();
        let a = f.registrar.create(&AuthContext::user("u1"), coach()).await.unwrap();
        let b = f.registrar.create(&AuthContext::user("u2"), coach()).await.unwrap();
        assert_eq!(a.handle, "ceo-coach");
        assert_eq!(b.handle, "ceo-coach");
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_unique_handles() {
        let f = Arc::new(fixture());
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let f = f.clone();
            tasks.push(tokio::spawn(async move {
                f.registrar
                    .create(&AuthContext::user("u1"), coach())
                    .await
                    .unwrap()
                    .handle
            }));
        }

        let mut handles = HashSet::new();
        for task in tasks {
            assert!(handles.insert(task.await.unwrap()));
        }
        assert_eq!(handles.len(), 10);
    }

    #[tokio::test]
    async fn test_creator_is_linked() {
        let f = fixture();
        let caller = AuthContext::user("u1");
        let created = f.registrar.create(&caller, coach()).await.unwrap();

        let links = f.repo.list_links("u1").await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].advisor_id, created.advisor_id);
        assert_eq!(links[0].source, LinkSource::Created);
    }

    #[tokio::test]
    async fn test_link_failure_removes_advisor() {
        let f = fixture();
        // Advisor row goes through, link row fails
        f.repo.fail_writes_after(1, 1);

        let err = f.registrar.insert("u1", coach()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageError);
        assert!(f.repo.list_advisors_by_owner("u1").await.unwrap().is_empty());
        assert!(f.repo.list_links("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_payload() {
        let f = fixture();
        let payload = AdvisorPayload::new("CEO Coach", "   ", "mission");
        let err = f
            .registrar
            .create(&AuthContext::user("u1"), payload)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
        assert!(err.to_string().contains("oneLiner"));
    }

    #[tokio::test]
    async fn test_invalid_persona_rejected() {
        let f = fixture();
        let mut payload = coach();
        payload.persona = Some(Persona::new("", "Coach"));
        let err = f
            .registrar
            .create(&AuthContext::user("u1"), payload)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn test_anonymous_rejected() {
        let f = fixture();
        let err = f
            .registrar
            .create(&AuthContext::anonymous(), coach())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthenticated);
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let f = fixture_with_limit(1);
        let caller = AuthContext::user("u1");
        f.registrar.create(&caller, coach()).await.unwrap();
        let err = f.registrar.create(&caller, coach()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
    }

    #[tokio::test]
    async fn test_idempotent_create() {
        let f = fixture();
        let caller = AuthContext::user("u1");

        let first = f
            .registrar
            .create_with_key(&caller, Some("attempt-1"), coach())
            .await
            .unwrap();
        let retry = f
            .registrar
            .create_with_key(&caller, Some("attempt-1"), coach())
            .await
            .unwrap();

        assert_eq!(first, retry);
        assert_eq!(f.repo.list_advisors_by_owner("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_idempotent_create_survives_record_write_failure() {
        let f = fixture();
        let caller = AuthContext::user("u1");
        // Rate window, advisor and link succeed; the first record write fails.
        f.repo.fail_writes_after(3, 1);

        let first = f
            .registrar
            .create_with_key(&caller, Some("k1"), coach())
            .await
            .unwrap();
        let retry = f
            .registrar
            .create_with_key(&caller, Some("k1"), coach())
            .await
            .unwrap();

        assert_eq!(first, retry);
        assert_eq!(retry.handle, "ceo-coach");
        assert_eq!(f.repo.list_advisors_by_owner("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handle_attempts_exhausted_conflict() {
        let f = fixture();
        let registrar = IdentityRegistrar::new(
            f.repo.clone(),
            Arc::new(ManualClock::default()),
            f.registrar.limiter.clone(),
            f.registrar.idempotency.clone(),
            2,
        );
        let caller = AuthContext::user("u1");
        registrar.create(&caller, coach()).await.unwrap();
        registrar.create(&caller, coach()).await.unwrap();
        let err = registrar.create(&caller, coach()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_select_and_unselect() {
        let f = fixture();
        let owner = AuthContext::user("u1");
        let other = AuthContext::user("u2");
        let created = f.registrar.create(&owner, coach()).await.unwrap();

        assert!(f.registrar.select(&other, &created.advisor_id, None).await.unwrap());
        assert!(!f.registrar.select(&other, &created.advisor_id, None).await.unwrap());
        assert_eq!(f.registrar.selected_advisors(&other).await.unwrap().len(), 1);

        assert!(f.registrar.unselect(&other, &created.advisor_id).await.unwrap());
        assert!(f.registrar.selected_advisors(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_hides_from_selection() {
        let f = fixture();
        let owner = AuthContext::user("u1");
        let created = f.registrar.create(&owner, coach()).await.unwrap();

        let err = f
            .registrar
            .archive(&AuthContext::user("u2"), &created.advisor_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);

        let archived = f.registrar.archive(&owner, &created.advisor_id).await.unwrap();
        assert_eq!(archived.status, AdvisorStatus::Archived);
        assert!(f.registrar.selected_advisors(&owner).await.unwrap().is_empty());

        let err = f
            .registrar
            .select(&AuthContext::user("u2"), &created.advisor_id, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
