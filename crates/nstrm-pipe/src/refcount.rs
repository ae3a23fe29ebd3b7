//! Join counter with a broadcast zero-crossing event.
//!
//! A [`Ref`] counts outstanding interest in a resource. Stages use it to learn
//! that no further endpoints will be attached; scopes use it to learn that no
//! running task still holds one of their values. Every adjustment made by the
//! runtime goes through a [`Lease`], so increments and decrements stay paired.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared counter. Cloning a `Ref` yields another handle to the **same** count.
#[derive(Clone)]
pub struct Ref {
    count: Arc<watch::Sender<usize>>,
}

impl Ref {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    pub fn incref(&self) {
        self.count.send_modify(|c| *c += 1);
    }

    /// Decrement the count.
    ///
    /// # Panics
    ///
    /// Panics when the count is already zero.
    pub fn decref(&self) {
        let mut underflow = false;
        self.count.send_modify(|c| match c.checked_sub(1) {
            Some(n) => *c = n,
            None => underflow = true,
        });
        if underflow {
            panic!("Ref::decref without a matching incref");
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until the count is zero. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|c| *c == 0).await;
    }

    /// Increment and return a guard that decrements on drop.
    pub fn lease(&self) -> Lease {
        self.incref();
        Lease { refs: self.clone() }
    }

    /// True when both handles share one count.
    pub fn same(&self, other: &Ref) -> bool {
        Arc::ptr_eq(&self.count, &other.count)
    }
}

impl Default for Ref {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ref").field("count", &self.count()).finish()
    }
}

/// One unit of interest in a [`Ref`], released on drop.
#[must_use = "dropping a lease releases it immediately"]
#[derive(Debug)]
pub struct Lease {
    refs: Ref,
}

impl Lease {
    pub fn refs(&self) -> &Ref {
        &self.refs
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.refs.decref();
    }
}

/// Anything whose lifetime is tracked by a [`Ref`].
pub trait Counted {
    fn refs(&self) -> &Ref;

    fn lease(&self) -> Lease {
        self.refs().lease()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_before_any_increment_returns_immediately() {
        let refs = Ref::new();
        tokio::time::timeout(Duration::from_millis(100), refs.wait())
            .await
            .expect("wait on a fresh Ref should not block");
    }

    #[tokio::test]
    async fn wait_unblocks_only_when_balanced() {
        let refs = Ref::new();
        refs.incref();
        refs.incref();

        let waiter = {
            let refs = refs.clone();
            tokio::spawn(async move { refs.wait().await })
        };

        refs.decref();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "one increment is still outstanding");

        refs.decref();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should finish once balanced")
            .unwrap();
        assert_eq!(refs.count(), 0);
    }

    #[tokio::test]
    async fn lease_releases_on_drop() {
        let refs = Ref::new();
        let a = refs.lease();
        let b = refs.lease();
        assert_eq!(refs.count(), 2);
        drop(a);
        assert_eq!(refs.count(), 1);
        assert!(b.refs().same(&refs));
        drop(b);
        assert_eq!(refs.count(), 0);
    }

    #[test]
    #[should_panic(expected = "without a matching incref")]
    fn decref_below_zero_panics() {
        Ref::new().decref();
    }
}
