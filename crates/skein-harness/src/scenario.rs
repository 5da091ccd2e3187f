//! Catalogue of named scenarios.
//!
//! Each scenario is a small concurrent program with a known answer: the
//! buggy ones contain a race the engine should find, the fixed ones must
//! never fail however many schedules are explored.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
    str::FromStr,
};

use bytes::Bytes;
use skein_core::{
    Context, EngineError, ExplorationReport, Explorer, Fault, OperationResult, ReplayOutcome,
    ResourceLock, Trace,
};
use thiserror::Error;

use crate::store::{ChaoticStore, SimStore, Store, StoreError};

/// Scenario name not in the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown scenario '{0}' (try `skein list`)")]
pub struct UnknownScenario(pub String);

/// Built-in scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// Two clients register the same user with a read-then-write.
    CreateRace,
    /// Same registration using the store's atomic create.
    CreateRaceFixed,
    /// Two workers increment a counter with a read, a switch and a write.
    CounterRace,
    /// Same increments inside a critical section.
    CounterLocked,
    /// Two workers take two locks in opposite order.
    LockOrder,
    /// A client retries a create after a lost acknowledgement.
    LostAck,
}

impl Scenario {
    /// Every scenario, in listing order.
    pub const ALL: [Self; 6] = [
        Self::CreateRace,
        Self::CreateRaceFixed,
        Self::CounterRace,
        Self::CounterLocked,
        Self::LockOrder,
        Self::LostAck,
    ];

    /// Name used on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Self::CreateRace => "create-race",
            Self::CreateRaceFixed => "create-race-fixed",
            Self::CounterRace => "counter-race",
            Self::CounterLocked => "counter-locked",
            Self::LockOrder => "lock-order",
            Self::LostAck => "lost-ack",
        }
    }

    /// One-line description.
    pub fn description(self) -> &'static str {
        match self {
            Self::CreateRace => "check-then-create registration; both clients can succeed",
            Self::CreateRaceFixed => "atomic create; exactly one client succeeds",
            Self::CounterRace => "unguarded read-modify-write; an update can be lost",
            Self::CounterLocked => "read-modify-write under a lock; no update is lost",
            Self::LockOrder => "opposite lock acquisition order; can deadlock",
            Self::LostAck => "create retried after an injected lost ack; reports a false failure",
        }
    }

    /// Whether the scenario contains a bug.
    pub fn is_buggy(self) -> bool {
        !matches!(self, Self::CreateRaceFixed | Self::CounterLocked)
    }

    /// Explore the scenario.
    pub fn explore(self, explorer: &Explorer) -> Result<ExplorationReport, EngineError> {
        match self {
            Self::CreateRace => explorer.explore(create_race),
            Self::CreateRaceFixed => explorer.explore(create_race_fixed),
            Self::CounterRace => explorer.explore(counter_race),
            Self::CounterLocked => explorer.explore(counter_locked),
            Self::LockOrder => explorer.explore(lock_order),
            Self::LostAck => explorer.explore(lost_ack),
        }
    }

    /// Replay `trace` against the scenario.
    pub fn replay(self, explorer: &Explorer, trace: &Trace) -> Result<ReplayOutcome, EngineError> {
        match self {
            Self::CreateRace => explorer.replay(create_race, trace),
            Self::CreateRaceFixed => explorer.replay(create_race_fixed, trace),
            Self::CounterRace => explorer.replay(counter_race, trace),
            Self::CounterLocked => explorer.replay(counter_locked, trace),
            Self::LockOrder => explorer.replay(lock_order, trace),
            Self::LostAck => explorer.replay(lost_ack, trace),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = UnknownScenario;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| UnknownScenario(s.to_string()))
    }
}

/// Result of one registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The client believes it created the user.
    Created,
    /// The user already existed.
    AlreadyExists,
    /// The request failed.
    Failed(StoreError),
}

/// Register `user` by reading first and writing only if absent.
///
/// The existence check and the write are separate requests, so two clients
/// can both see no row and both write.
pub async fn register_checked(store: &impl Store, user: &str, name: &str) -> Registration {
    match store.get(user).await {
        Ok(Some(_)) => Registration::AlreadyExists,
        Ok(None) => match store.upsert(user, Bytes::copy_from_slice(name.as_bytes()), None).await {
            Ok(_) => Registration::Created,
            Err(err) => Registration::Failed(err),
        },
        Err(err) => Registration::Failed(err),
    }
}

/// Register `user` with the store's atomic create.
pub async fn register_atomic(store: &impl Store, user: &str, name: &str) -> Registration {
    match store.create(user, Bytes::copy_from_slice(name.as_bytes())).await {
        Ok(_) => Registration::Created,
        Err(StoreError::RowAlreadyExists { .. }) => Registration::AlreadyExists,
        Err(err) => Registration::Failed(err),
    }
}

/// Two clients race to register the same user; return both results.
async fn registration_race<S, R, Fut>(cx: &Context, store: Rc<S>, register: R) -> Vec<Registration>
where
    S: Store + 'static,
    R: Fn(Rc<S>, &'static str) -> Fut,
    Fut: Future<Output = Registration> + 'static,
{
    let results = Rc::new(RefCell::new(Vec::new()));

    let mut handles = Vec::new();
    for name in ["alice", "bob"] {
        let results = Rc::clone(&results);
        let attempt = register(Rc::clone(&store), name);
        handles.push(
            cx.spawn(async move {
                let outcome = attempt.await;
                tracing::trace!(name, ?outcome, "registration finished");
                results.borrow_mut().push(outcome);
                Ok::<(), Fault>(())
            })
            .await,
        );
    }
    for handle in handles {
        cx.join(handle).await;
    }

    results.take()
}

/// Buggy registration: at most one client may report success.
pub async fn create_race(cx: Context) -> OperationResult {
    let store = Rc::new(SimStore::new(cx.clone()));
    let results = registration_race(&cx, store, |store, name| async move {
        register_checked(&*store, "user:42", name).await
    })
    .await;

    let created = results.iter().filter(|r| **r == Registration::Created).count();
    cx.assert(created == 1, format!("{created} clients created user:42: {results:?}"))?;
    Ok(())
}

/// Fixed registration: exactly one success and one `RowAlreadyExists`.
pub async fn create_race_fixed(cx: Context) -> OperationResult {
    let store = Rc::new(SimStore::new(cx.clone()));
    let results = registration_race(&cx, store, |store, name| async move {
        register_atomic(&*store, "user:42", name).await
    })
    .await;

    let created = results.iter().filter(|r| **r == Registration::Created).count();
    let rejected = results.iter().filter(|r| **r == Registration::AlreadyExists).count();
    cx.assert(created == 1 && rejected == 1, format!("unexpected registrations: {results:?}"))?;
    Ok(())
}

async fn increment(
    cx: Context,
    counter: Rc<Cell<u64>>,
    lock: Option<ResourceLock>,
) -> OperationResult {
    if let Some(lock) = &lock {
        cx.enter_critical_section(lock).await;
    }

    let read = counter.get();
    cx.force_schedule_point().await;
    counter.set(read + 1);

    if let Some(lock) = &lock {
        cx.exit_critical_section(lock).await?;
    }
    Ok(())
}

async fn counter_workers(cx: Context, locked: bool) -> OperationResult {
    let counter = Rc::new(Cell::new(0u64));
    let lock = locked.then(|| cx.new_lock("counter"));

    let watched = Rc::clone(&counter);
    cx.register_invariant("counter never exceeds workers", move || {
        if watched.get() <= 2 { Ok(()) } else { Err(format!("counter is {}", watched.get())) }
    });

    let first = cx.spawn(increment(cx.clone(), Rc::clone(&counter), lock.clone())).await;
    let second = cx.spawn(increment(cx.clone(), Rc::clone(&counter), lock)).await;
    cx.join(first).await;
    cx.join(second).await;

    cx.assert(counter.get() == 2, format!("stale overwrite: counter is {}", counter.get()))?;
    Ok(())
}

/// Unguarded read-modify-write by two workers.
pub async fn counter_race(cx: Context) -> OperationResult {
    counter_workers(cx, false).await
}

/// Read-modify-write by two workers under one lock.
pub async fn counter_locked(cx: Context) -> OperationResult {
    counter_workers(cx, true).await
}

async fn take_in_order(cx: Context, first: ResourceLock, second: ResourceLock) -> OperationResult {
    cx.enter_critical_section(&first).await;
    cx.enter_critical_section(&second).await;
    cx.exit_critical_section(&second).await?;
    cx.exit_critical_section(&first).await?;
    Ok(())
}

/// Two workers acquire the same two locks in opposite order.
pub async fn lock_order(cx: Context) -> OperationResult {
    let accounts = cx.new_lock("accounts");
    let ledger = cx.new_lock("ledger");

    let transfer = cx.spawn(take_in_order(cx.clone(), accounts.clone(), ledger.clone())).await;
    let audit = cx.spawn(take_in_order(cx.clone(), ledger, accounts)).await;
    cx.join(transfer).await;
    cx.join(audit).await;
    Ok(())
}

/// A client creates a row through a flaky store and retries on
/// `Unavailable`. When the first attempt was applied but its ack was lost,
/// the retry sees `RowAlreadyExists` and the client reports failure for a
/// row that exists.
pub async fn lost_ack(cx: Context) -> OperationResult {
    let store = ChaoticStore::new(SimStore::new(cx.clone()), cx.clone(), 30);

    let mut outcome = register_atomic(&store, "order:7", "widget").await;
    for _ in 0..3 {
        if !matches!(outcome, Registration::Failed(StoreError::Unavailable { .. })) {
            break;
        }
        outcome = register_atomic(&store, "order:7", "widget").await;
    }

    let stored = store.inner().peek("order:7").is_some();
    let reported = outcome == Registration::Created;
    cx.assert(
        stored == reported || matches!(outcome, Registration::Failed(_)),
        format!("row stored={stored} but client saw {outcome:?}"),
    )?;
    Ok(())
}
