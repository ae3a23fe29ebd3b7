//! Execution scopes.
//!
//! An [`Env`] is a counted handle to one node of the scope tree. A scope
//! lives until every handle to it is gone; it then drops its bindings and
//! lets go of its parent. Pipelines built in a scope are parked on it and
//! started when the scope is run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use nstrm_pipe::{Lease, Pipe, Ref, Valve};
use nstrm_types::NstrmError;
use uuid::Uuid;

use crate::gc;
use crate::value::Value;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

/// Errors raised inside stage tasks, where nobody is waiting to receive
/// them. Shared by every scope of one program.
#[derive(Clone, Default)]
pub struct Faults {
    inner: Arc<Mutex<Vec<NstrmError>>>,
}

impl Faults {
    pub fn report(&self, err: NstrmError) {
        tracing::error!(error = %err, "Stage failed");
        lock(&self.inner).push(err);
    }

    pub fn take(&self) -> Vec<NstrmError> {
        std::mem::take(&mut *lock(&self.inner))
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Pending {
    stages: Vec<Pipe<Value>>,
    deferred: Vec<Value>,
}

struct Scope {
    id: Uuid,
    parent: Option<Arc<Scope>>,
    /// Interest in the parent, dropped once this scope has drained.
    parent_hold: Mutex<Option<Lease>>,
    namespace: RwLock<HashMap<String, Value>>,
    out: RwLock<Valve<Value>>,
    pending: Mutex<Pending>,
    refs: Ref,
    faults: Faults,
}

impl Scope {
    fn new(parent: Option<&Env>, out: Valve<Value>, faults: Faults) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            parent: parent.map(|p| p.scope.clone()),
            parent_hold: Mutex::new(parent.map(|p| p.scope.refs.lease())),
            namespace: RwLock::new(HashMap::new()),
            out: RwLock::new(out),
            pending: Mutex::new(Pending::default()),
            refs: Ref::new(),
            faults,
        })
    }

    fn get(&self, name: &str) -> Option<Value> {
        self.namespace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Clear everything the scope holds once nobody refers to it.
    fn drain(&self) {
        let bindings = std::mem::take(
            &mut *self
                .namespace
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let pending = std::mem::take(&mut *lock(&self.pending));
        drop(bindings);
        drop(pending);
        let parent = lock(&self.parent_hold).take();
        tracing::debug!(scope = %self.id, root = parent.is_none(), "Scope ended");
        drop(parent);
    }
}

// ---------------------------------------------------------------------------
// Env
// ---------------------------------------------------------------------------

/// Counted handle to a scope. Cloning takes another unit of interest.
pub struct Env {
    scope: Arc<Scope>,
    _lease: Option<Lease>,
}

impl Env {
    /// A fresh root scope. Its output is closed: `emit` outside any
    /// pipeline ends the enclosing call.
    pub fn root() -> Self {
        Self::open(None, Valve::closed(), Faults::default())
    }

    /// A scope nested in this one. It inherits the output valve and keeps
    /// this scope alive until it has drained.
    pub fn child(&self) -> Self {
        let out = self.out();
        Self::open(Some(self), out, self.scope.faults.clone())
    }

    fn open(parent: Option<&Env>, out: Valve<Value>, faults: Faults) -> Self {
        let scope = Scope::new(parent, out, faults);
        let lease = Some(scope.refs.lease());

        let watched = scope.clone();
        tokio::spawn(async move {
            watched.refs.wait().await;
            watched.drain();
        });

        Self {
            scope,
            _lease: lease,
        }
    }

    pub fn id(&self) -> Uuid {
        self.scope.id
    }

    pub fn refs(&self) -> &Ref {
        &self.scope.refs
    }

    pub fn faults(&self) -> Faults {
        self.scope.faults.clone()
    }

    // --- namespace ---

    /// Bind `name`. Rebinds the nearest enclosing scope that already has
    /// the name, otherwise binds here. The previous value's lease is
    /// released.
    pub fn define(&self, name: &str, value: Value) {
        let mut scope = Some(&self.scope);
        while let Some(s) = scope {
            let mut namespace = s.namespace.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = namespace.get_mut(name) {
                let old = std::mem::replace(slot, value);
                drop(namespace);
                drop(old);
                return;
            }
            drop(namespace);
            scope = s.parent.as_ref();
        }
        self.define_builtin(name, value);
    }

    /// Bind `name` in this scope only, shadowing outer bindings.
    pub fn define_builtin(&self, name: &str, value: Value) {
        let old = self
            .scope
            .namespace
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value);
        drop(old);
    }

    /// Resolve `name` through this scope and its ancestors. Each scope's
    /// lock is taken on its own.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = Some(&self.scope);
        while let Some(s) = scope {
            if let Some(value) = s.get(name) {
                return Some(value);
            }
            scope = s.parent.as_ref();
        }
        None
    }

    // --- output ---

    pub fn set_out(&self, out: Valve<Value>) {
        *self
            .scope
            .out
            .write()
            .unwrap_or_else(PoisonError::into_inner) = out;
    }

    pub fn out(&self) -> Valve<Value> {
        self.scope
            .out
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send `value` to this scope's output. `false` when nobody is reading.
    pub async fn send(&self, value: Value) -> bool {
        let out = self.out();
        out.send(value).await
    }

    // --- lifecycle ---

    /// Start `stage` when this scope runs.
    pub fn run_later(&self, stage: &Pipe<Value>) {
        let mut pending = lock(&self.scope.pending);
        if !pending.stages.iter().any(|p| p.id() == stage.id()) {
            pending.stages.push(stage.clone());
        }
    }

    /// Hold `value` until this scope runs.
    pub fn decref_later(&self, value: Value) {
        if value.refs().is_some() {
            lock(&self.scope.pending).deferred.push(value);
        }
    }

    /// Leave the scope in the background: start its pipelines, let go of
    /// deferred values, and once the pipelines are done and `ret` is no
    /// longer held elsewhere, release every binding.
    pub fn run(&self, ret: Value) {
        let env = self.clone();
        let join = self.start_pending();
        let ret = ret.uncounted();
        tokio::spawn(async move {
            env.settle(join, ret).await;
        });
    }

    /// Like [`Env::run`], but waits for it and then for the whole scope tree
    /// rooted here to drain. Used for the top-level program.
    pub async fn run_wait(self, ret: Value) {
        let join = self.start_pending();
        let ret = ret.uncounted();
        self.settle(join, ret).await;

        let refs = self.scope.refs.clone();
        let id = self.scope.id;
        drop(self);
        refs.wait().await;
        tracing::debug!(scope = %id, "Scope tree drained");
    }

    /// Start pending pipelines and wait for them, keeping the scope open.
    pub async fn flush(&self) {
        let join = self.start_pending();
        join.wait().await;
    }

    fn start_pending(&self) -> Ref {
        let Pending { stages, deferred } = std::mem::take(&mut *lock(&self.scope.pending));
        let join = Ref::new();
        for stage in &stages {
            tracing::debug!(scope = %self.scope.id, stage = %stage.id(), role = %stage.role(), "Run");
            stage.run(&join);
        }
        drop(deferred);
        join
    }

    async fn settle(&self, join: Ref, ret: Value) {
        join.wait().await;
        self.release_matching(&ret);
        gc::wait_if(&ret).await;
        self.release_bindings();
    }

    /// Bindings here that hold `ret` itself would keep it alive forever.
    fn release_matching(&self, ret: &Value) {
        if ret.refs().is_none() {
            return;
        }
        let mut namespace = self
            .scope
            .namespace
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for value in namespace.values_mut() {
            if gc::same_resource(value, ret) {
                value.release();
            }
        }
    }

    /// Stage bindings are dropped outright: a settled stage keeps its
    /// result, and a counted value in there would hold this scope forever.
    /// Everything else is downgraded in place.
    fn release_bindings(&self) {
        let mut namespace = self
            .scope
            .namespace
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(scope = %self.scope.id, bindings = namespace.len(), "Release bindings");
        let mut stages = Vec::new();
        namespace.retain(|_, value| {
            if holds_stage(value) {
                stages.push(std::mem::take(value));
                false
            } else {
                true
            }
        });
        namespace.values_mut().for_each(Value::release);
        drop(namespace);
        drop(stages);
    }
}

fn holds_stage(value: &Value) -> bool {
    match value {
        Value::Stage(_) => true,
        Value::Array(items) => items.iter().any(holds_stage),
        _ => false,
    }
}

impl Clone for Env {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            _lease: Some(self.scope.refs.lease()),
        }
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("id", &self.scope.id)
            .field("refs", &self.scope.refs.count())
            .finish()
    }
}
