//! # Lifetime Guard
//!
//! Every registered allocation carries a [`LifetimeGuard`]: a two-state
//! machine that makes "free exactly once, and only by the owner" a
//! structural property instead of a convention.
//!
//! ## State Machine
//!
//! | State | Meaning |
//! |------:|--------|
//! | `Live` | storage valid; views may be created and accessed |
//! | `Released` | storage freed; terminal |
//!
//! The only transition is `Live → Released`, performed by [`LifetimeGuard::seal`]
//! after [`LifetimeGuard::authorize_release`] succeeded.
//!
//! ## Why per-context copies never free
//!
//! Private copies of a structure that holds a pointer to shared storage are
//! created and destroyed once per context. If any of them freed the storage
//! on destruction, the storage would be freed once per context. Here views
//! are always non-owning: removing a view returns only the view's own
//! buffers, and release is authorized solely for the owner context, once.

use crate::engine::error::{
    DoubleReleaseError, NotOwnerError, ResidencyResult, UseAfterReleaseError,
};
use crate::engine::types::{AllocationID, ContextID};

/// Lifecycle of one allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Storage is valid.
    Live,
    /// Storage has been freed.
    Released,
}

/// Enforces single, owner-only release of an allocation.
#[derive(Clone, Copy, Debug)]
pub struct LifetimeGuard {
    allocation: AllocationID,
    owner: ContextID,
    state: Lifecycle,
}

impl LifetimeGuard {
    /// Creates a guard in the `Live` state.
    pub fn new(allocation: AllocationID, owner: ContextID) -> Self {
        Self { allocation, owner, state: Lifecycle::Live }
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Returns `true` once released.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.state == Lifecycle::Released
    }

    /// Fails with `UseAfterRelease` unless the allocation is live.
    #[inline]
    pub fn ensure_live(&self) -> Result<(), UseAfterReleaseError> {
        match self.state {
            Lifecycle::Live => Ok(()),
            Lifecycle::Released => Err(UseAfterReleaseError { allocation: self.allocation }),
        }
    }

    /// Checks whether `caller` may release now.
    ///
    /// A second release is reported as `DoubleRelease` before ownership is
    /// considered, so the owner and non-owners see the same terminal error.
    pub fn authorize_release(&self, caller: ContextID) -> ResidencyResult<()> {
        if self.state == Lifecycle::Released {
            return Err(DoubleReleaseError { allocation: self.allocation }.into());
        }
        if caller != self.owner {
            return Err(NotOwnerError {
                allocation: self.allocation,
                owner: self.owner,
                caller,
            }
            .into());
        }
        Ok(())
    }

    /// Transitions to `Released`.
    pub fn seal(&mut self) {
        debug_assert_eq!(self.state, Lifecycle::Live);
        self.state = Lifecycle::Released;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::ResidencyError;

    #[test]
    fn only_the_owner_may_release() {
        let guard = LifetimeGuard::new(7, 1);
        assert!(matches!(
            guard.authorize_release(2),
            Err(ResidencyError::NotOwner(NotOwnerError { allocation: 7, owner: 1, caller: 2 }))
        ));
        assert!(guard.authorize_release(1).is_ok());
    }

    #[test]
    fn released_is_terminal() {
        let mut guard = LifetimeGuard::new(3, 0);
        guard.authorize_release(0).unwrap();
        guard.seal();
        assert!(guard.is_released());
        assert_eq!(guard.ensure_live(), Err(UseAfterReleaseError { allocation: 3 }));
        assert!(matches!(guard.authorize_release(0), Err(ResidencyError::DoubleRelease(_))));
        assert!(matches!(guard.authorize_release(5), Err(ResidencyError::DoubleRelease(_))));
    }
}
