//! The blocking bridge: driving suspending operations from blocking code.
//!
//! [`SyncBridge`] schedules a suspending operation onto the runtime its
//! handle points at and blocks the calling thread until it completes. It is
//! one-directional by design: blocking code waits on the scheduler, never
//! the other way around. The bridge is injectable, so a blocking step
//! executing under the suspending engine can receive one as an ordinary
//! parameter and call suspending steps or resolvers through it without
//! knowing which engine is driving.
//!
//! The calling thread must not be a scheduler thread; the suspending engine
//! guarantees this by running blocking steps on the worker pool.

use core::fmt;
use core::future::Future;

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use skein_core::declarations::{Requires, Returns};
use skein_core::error::{Error, Result};
use skein_core::key::{Label, TypeKey};
use skein_core::requirement::{Need, Resolved};
use skein_core::scope::Scope;
use skein_core::step::{Injectable, Res};

use crate::engine::{AsyncScope, AsyncStep, IntoAsyncStep};

/// A blocking handle over a scope and a scheduler, for calling suspending
/// operations from non-suspending code.
#[derive(Clone)]
pub struct SyncBridge {
    scope: Scope,
    handle: Handle,
}

impl SyncBridge {
    /// Creates a bridge over `scope`, scheduling onto `handle`.
    #[must_use]
    pub fn new(scope: Scope, handle: Handle) -> Self {
        Self { scope, handle }
    }

    /// The underlying scope. Registration, removal, and blocking lookups
    /// are plain store operations; use them directly through this.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The suspending engine this bridge schedules onto.
    #[must_use]
    pub fn engine(&self) -> AsyncScope {
        AsyncScope::new(self.scope.clone(), self.handle.clone())
    }

    fn block_on_scheduled<T: Send + 'static>(
        &self,
        fut: impl Future<Output = T> + Send + 'static,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        // Detach the task; completion is observed through the channel.
        let _task = self.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.blocking_recv()
            .expect("scheduled operation panicked before completing")
    }

    /// Calls a suspending step, blocking until the scheduler completes it.
    ///
    /// # Errors
    ///
    /// As for [`AsyncScope::call`].
    pub fn call<Marker, S>(&self, step: S) -> Result<<S::Step as AsyncStep>::Output>
    where
        S: IntoAsyncStep<Marker>,
    {
        let step = step.into_async_step();
        let engine = self.engine();
        self.block_on_scheduled(async move { engine.call(step).await })
    }

    /// Like [`call`](Self::call), with explicit requirements.
    ///
    /// # Errors
    ///
    /// As for [`call`](Self::call).
    pub fn call_with<Marker, S>(
        &self,
        step: S,
        requires: Requires,
    ) -> Result<<S::Step as AsyncStep>::Output>
    where
        S: IntoAsyncStep<Marker>,
    {
        let step = step.into_async_step();
        let engine = self.engine();
        self.block_on_scheduled(async move { engine.call_with(step, requires).await })
    }

    /// Extracts a suspending step, blocking until the scheduler completes
    /// it; storage side effects match the suspending engine exactly.
    ///
    /// # Errors
    ///
    /// As for [`AsyncScope::extract`].
    pub fn extract<Marker, S>(&self, step: S) -> Result<Res<<S::Step as AsyncStep>::Output>>
    where
        S: IntoAsyncStep<Marker>,
    {
        self.extract_with(step, None, None)
    }

    /// Like [`extract`](Self::extract), with explicit declarations.
    ///
    /// # Errors
    ///
    /// As for [`extract`](Self::extract).
    pub fn extract_with<Marker, S>(
        &self,
        step: S,
        requires: Option<Requires>,
        returns: Option<Returns>,
    ) -> Result<Res<<S::Step as AsyncStep>::Output>>
    where
        S: IntoAsyncStep<Marker>,
    {
        let step = step.into_async_step();
        let engine = self.engine();
        self.block_on_scheduled(async move { engine.extract_with(step, requires, returns).await })
    }

    /// Resolves one requirement on the scheduler, blocking until done.
    ///
    /// # Errors
    ///
    /// As for [`AsyncScope::resolve`].
    pub fn resolve(&self, need: &Need) -> Result<Resolved> {
        let need = need.clone();
        let engine = self.engine();
        self.block_on_scheduled(async move { engine.resolve(&need).await })
    }

    /// Returns the resource of type `T`, driving suspending providers on
    /// the scheduler. Missing keys are `None`, never an error.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Res<T>> {
        let engine = self.engine();
        self.block_on_scheduled(async move { engine.get::<T>().await })
    }

    /// Returns the resource under `label`, downcast to `T`.
    #[must_use]
    pub fn get_labelled<T: Send + Sync + 'static>(&self, label: impl Into<Label>) -> Option<Res<T>> {
        let engine = self.engine();
        let label = label.into();
        self.block_on_scheduled(async move { engine.get_labelled::<T>(label).await })
    }
}

impl Injectable for SyncBridge {
    fn requirement() -> Need {
        Need::bridge()
    }

    fn inject(resolved: Resolved) -> Result<Self> {
        match resolved {
            Resolved::Value(value) => {
                let found = value.type_key();
                value
                    .downcast::<SyncBridge>()
                    .map(|bridge| (*bridge).clone())
                    .ok_or(Error::Inject {
                        expected: TypeKey::of::<SyncBridge>(),
                        found,
                    })
            }
            _ => Err(Error::Unsatisfied {
                requirement: Need::bridge().to_string(),
            }),
        }
    }
}

impl fmt::Debug for SyncBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<SyncBridge>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Clone)]
    struct T1(i32);
    #[derive(Debug, PartialEq, Clone)]
    struct T2(i32);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_step_drives_a_suspending_step_through_the_bridge() {
        async fn suspend_double(input: Res<T1>) -> T2 {
            T2(input.0 * 2)
        }

        fn blocking_step(bridge: SyncBridge) -> i32 {
            let doubled = bridge.call(suspend_double).expect("inner call succeeds");
            doubled.0
        }

        let engine = AsyncScope::new(Scope::new(), Handle::current());
        engine.scope().add(T1(10)).unwrap();
        let out = engine.call_blocking(blocking_step).await.unwrap();
        assert_eq!(out, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bridge_get_drives_suspending_resolvers() {
        fn blocking_step(bridge: SyncBridge) -> i32 {
            bridge.get::<T1>().map(|v| v.0).unwrap_or(-1)
        }

        let engine = AsyncScope::new(Scope::new(), Handle::current());
        engine
            .scope()
            .add_async_resolver(|_ctx| async { Some(T1(7)) })
            .unwrap();
        let out = engine.call_blocking(blocking_step).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bridge_extract_shares_storage_with_the_engine() {
        async fn produce() -> T2 {
            T2(5)
        }

        fn blocking_step(bridge: SyncBridge) -> i32 {
            bridge.extract(produce).expect("extract succeeds").0
        }

        let engine = AsyncScope::new(Scope::new(), Handle::current());
        let out = engine.call_blocking(blocking_step).await.unwrap();
        assert_eq!(out, 5);
        assert_eq!(engine.scope().get::<T2>().unwrap().0, 5);
    }

    #[test]
    fn bridge_is_unavailable_on_the_blocking_engine() {
        fn blocking_step(_bridge: SyncBridge) -> i32 {
            0
        }

        let scope = Scope::new();
        let err = scope.call(blocking_step).unwrap_err();
        assert!(matches!(err, Error::Suspending { .. }));
    }
}
