//! Persistence boundary for templates and sequence runs, plus an in-memory
//! store backed by DashMap.
//!
//! Every read-modify-write of a run happens under a lease: the scheduler
//! obtains leases in bulk through [`SequenceStore::claim_due_runs`], lifecycle
//! operations one at a time through [`SequenceStore::lock_run`]. A write is
//! only accepted from the current lease holder, and leases expire so a crashed
//! worker cannot pin a run forever.
//!
//! Due-ness is judged against the caller's logical `now`; lease expiry is
//! judged against the store's own wall clock, so a tick running with a later
//! logical time cannot steal a run another worker is still dispatching.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use drip_core::{DripError, DripResult};

use crate::types::{SequenceRun, SequenceTemplate};

/// Proof of holding the lease on a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A run snapshot read under a lease.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run: SequenceRun,
    pub token: LockToken,
}

#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn insert_template(&self, template: SequenceTemplate) -> DripResult<()>;

    async fn update_template(&self, template: SequenceTemplate) -> DripResult<()>;

    async fn get_template(&self, id: Uuid) -> DripResult<Option<SequenceTemplate>>;

    async fn list_templates(&self) -> DripResult<Vec<SequenceTemplate>>;

    /// Inserts a new run, failing with `DuplicateActiveRun` if the
    /// (template, recipient) pair already has a non-terminal run.
    async fn insert_run(&self, run: SequenceRun) -> DripResult<()>;

    async fn get_run(&self, id: Uuid) -> DripResult<Option<SequenceRun>>;

    /// The non-terminal run for a (template, recipient) pair, if any.
    async fn find_open_run(&self, template_id: Uuid, recipient: &str)
        -> DripResult<Option<SequenceRun>>;

    async fn list_runs(&self, template_id: Uuid) -> DripResult<Vec<SequenceRun>>;

    async fn runs_for_recipient(&self, recipient: &str) -> DripResult<Vec<SequenceRun>>;

    /// Atomically leases up to `limit` Active runs that are due at `now` and
    /// not leased by anyone else.
    async fn claim_due_runs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        ttl: Duration,
    ) -> DripResult<Vec<ClaimedRun>>;

    /// Leases a single run regardless of its status. `Ok(None)` means another
    /// holder currently owns the lease.
    async fn lock_run(&self, id: Uuid, ttl: Duration) -> DripResult<Option<ClaimedRun>>;

    /// Extends a lease the caller still holds. `Ok(false)` means the lease
    /// expired or was taken over and the caller must not act on the run.
    async fn renew_lease(&self, id: Uuid, token: LockToken, ttl: Duration) -> DripResult<bool>;

    /// Writes `run` and releases the lease. Fails with
    /// `ConcurrentModification` when `token` no longer holds the lease or the
    /// run's version moved. Returns the run as stored, with its new version.
    async fn commit_run(&self, run: SequenceRun, token: LockToken) -> DripResult<SequenceRun>;

    /// Drops a lease without writing. Releasing a lease that was already
    /// lost is not an error.
    async fn release_run(&self, id: Uuid, token: LockToken) -> DripResult<()>;
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: LockToken,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct StoredRun {
    run: SequenceRun,
    lease: Option<Lease>,
}

impl StoredRun {
    fn is_leased(&self, clock: DateTime<Utc>) -> bool {
        self.lease.is_some_and(|l| l.expires_at > clock)
    }

    fn holds(&self, token: LockToken, clock: DateTime<Utc>) -> bool {
        self.lease
            .is_some_and(|l| l.token == token && l.expires_at > clock)
    }

    fn take_lease(&mut self, clock: DateTime<Utc>, ttl: Duration) -> ClaimedRun {
        let token = LockToken::new();
        self.lease = Some(Lease {
            token,
            expires_at: clock + ttl,
        });
        ClaimedRun {
            run: self.run.clone(),
            token,
        }
    }
}

/// Thread-safe in-memory store for templates and runs.
///
/// Production deployments put a transactional database behind
/// [`SequenceStore`]; this keeps the same semantics for development and tests.
#[derive(Default)]
pub struct InMemorySequenceStore {
    templates: DashMap<Uuid, SequenceTemplate>,
    runs: DashMap<Uuid, StoredRun>,
    /// (template, recipient) -> non-terminal run id.
    open_runs: DashMap<(Uuid, String), Uuid>,
}

impl InMemorySequenceStore {
    pub fn new() -> Self {
        info!("Sequence store initialized (in-memory)");
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

impl fmt::Debug for InMemorySequenceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySequenceStore")
            .field("templates", &self.templates.len())
            .field("runs", &self.runs.len())
            .field("open_runs", &self.open_runs.len())
            .finish()
    }
}

#[async_trait]
impl SequenceStore for InMemorySequenceStore {
    async fn insert_template(&self, template: SequenceTemplate) -> DripResult<()> {
        self.templates.insert(template.id, template);
        Ok(())
    }

    async fn update_template(&self, template: SequenceTemplate) -> DripResult<()> {
        match self.templates.get_mut(&template.id) {
            Some(mut entry) => {
                *entry = template;
                Ok(())
            }
            None => Err(DripError::TemplateNotFound(template.id.to_string())),
        }
    }

    async fn get_template(&self, id: Uuid) -> DripResult<Option<SequenceTemplate>> {
        Ok(self.templates.get(&id).map(|r| r.value().clone()))
    }

    async fn list_templates(&self) -> DripResult<Vec<SequenceTemplate>> {
        let mut templates: Vec<SequenceTemplate> =
            self.templates.iter().map(|r| r.value().clone()).collect();
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(templates)
    }

    async fn insert_run(&self, run: SequenceRun) -> DripResult<()> {
        let key = (run.template_ref, run.recipient_ref.clone());
        match self.open_runs.entry(key) {
            Entry::Occupied(existing) => Err(DripError::DuplicateActiveRun {
                template_id: run.template_ref.to_string(),
                recipient: run.recipient_ref,
                run_id: existing.get().to_string(),
            }),
            Entry::Vacant(slot) => {
                let run_id = run.id;
                let open = !run.status.is_terminal();
                self.runs.insert(run_id, StoredRun { run, lease: None });
                if open {
                    slot.insert(run_id);
                }
                Ok(())
            }
        }
    }

    async fn get_run(&self, id: Uuid) -> DripResult<Option<SequenceRun>> {
        Ok(self.runs.get(&id).map(|r| r.value().run.clone()))
    }

    async fn find_open_run(
        &self,
        template_id: Uuid,
        recipient: &str,
    ) -> DripResult<Option<SequenceRun>> {
        let run_id = match self.open_runs.get(&(template_id, recipient.to_string())) {
            Some(entry) => *entry.value(),
            None => return Ok(None),
        };
        Ok(self.runs.get(&run_id).map(|r| r.value().run.clone()))
    }

    async fn list_runs(&self, template_id: Uuid) -> DripResult<Vec<SequenceRun>> {
        let mut runs: Vec<SequenceRun> = self
            .runs
            .iter()
            .filter(|r| r.value().run.template_ref == template_id)
            .map(|r| r.value().run.clone())
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }

    async fn runs_for_recipient(&self, recipient: &str) -> DripResult<Vec<SequenceRun>> {
        let mut runs: Vec<SequenceRun> = self
            .runs
            .iter()
            .filter(|r| r.value().run.recipient_ref == recipient)
            .map(|r| r.value().run.clone())
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }

    async fn claim_due_runs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        ttl: Duration,
    ) -> DripResult<Vec<ClaimedRun>> {
        let clock = Utc::now();
        let mut claimed = Vec::new();
        for mut entry in self.runs.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let stored = entry.value_mut();
            if stored.run.is_due(now) && !stored.is_leased(clock) {
                claimed.push(stored.take_lease(clock, ttl));
            }
        }
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed due runs");
        }
        Ok(claimed)
    }

    async fn lock_run(&self, id: Uuid, ttl: Duration) -> DripResult<Option<ClaimedRun>> {
        let clock = Utc::now();
        let mut entry = self
            .runs
            .get_mut(&id)
            .ok_or_else(|| DripError::RunNotFound(id.to_string()))?;
        if entry.is_leased(clock) {
            return Ok(None);
        }
        Ok(Some(entry.take_lease(clock, ttl)))
    }

    async fn renew_lease(&self, id: Uuid, token: LockToken, ttl: Duration) -> DripResult<bool> {
        let clock = Utc::now();
        let mut entry = self
            .runs
            .get_mut(&id)
            .ok_or_else(|| DripError::RunNotFound(id.to_string()))?;
        if !entry.holds(token, clock) {
            debug!(run_id = %id, "Lease lost before renewal");
            return Ok(false);
        }
        entry.lease = Some(Lease {
            token,
            expires_at: clock + ttl,
        });
        Ok(true)
    }

    async fn commit_run(&self, mut run: SequenceRun, token: LockToken) -> DripResult<SequenceRun> {
        let run_id = run.id;
        let committed = {
            let mut entry = self
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| DripError::RunNotFound(run_id.to_string()))?;
            let holds_lease = entry.lease.is_some_and(|l| l.token == token);
            if !holds_lease || entry.run.version != run.version {
                return Err(DripError::ConcurrentModification(run_id.to_string()));
            }
            run.version += 1;
            entry.run = run.clone();
            entry.lease = None;
            run
        };

        // Index maintenance runs after the run shard lock is dropped; insert_run
        // takes the index lock first.
        if committed.status.is_terminal() {
            self.open_runs.remove_if(
                &(committed.template_ref, committed.recipient_ref.clone()),
                |_, open_id| *open_id == run_id,
            );
        }
        Ok(committed)
    }

    async fn release_run(&self, id: Uuid, token: LockToken) -> DripResult<()> {
        if let Some(mut entry) = self.runs.get_mut(&id) {
            if entry.lease.is_some_and(|l| l.token == token) {
                entry.lease = None;
            }
        }
        Ok(())
    }
}
