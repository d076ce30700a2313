//! Interrupt masking and the cells it guards.
//!
//! The kernel owns exactly one lock: the port's interrupt mask. Raising the
//! mask to the maximum-syscall priority makes the single core momentarily
//! sequential, and that is the only condition under which kernel state may
//! be touched. This module encodes the condition in the type system: every
//! piece of kernel state lives in a [`KernelCell`], and reading or writing
//! one requires the token carried by a [`MaskGuard`], which can only exist
//! while the mask is raised. `tokenlock` supplies the zero-sized token
//! plumbing; the kernel merely decides when a token may come into being.
use core::{fmt, marker::PhantomData, ops};
use tokenlock::{SingletonTokenId, UnsyncSingletonToken, UnsyncTokenLock};

use crate::{error::BadContextError, utils::Init, PortThreading};

/// Brands tokens and keyholes with the system type, so two kernel instances
/// in one program cannot unlock each other's cells.
pub(crate) struct MaskTag<Traits>(PhantomData<Traits>);

type Token<Traits> = UnsyncSingletonToken<MaskTag<Traits>>;
type Keyhole<Traits> = SingletonTokenId<MaskTag<Traits>>;

/// A cell holding kernel state, accessible only while interrupts are
/// masked.
pub(super) struct KernelCell<Traits, T: ?Sized>(UnsyncTokenLock<T, Keyhole<Traits>>);

impl<Traits, T> KernelCell<Traits, T> {
    pub(super) const fn new(value: T) -> Self {
        Self(UnsyncTokenLock::new(Keyhole::INIT, value))
    }
}

impl<Traits, T: Init> Init for KernelCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

// The inner `UnsyncTokenLock` already carries the whole access vocabulary
// (`read`, `write`, `get`, `replace`, `replace_with`); the cell only fixes
// the keyhole type, so it hands the inner lock straight through.
impl<Traits, T> ops::Deref for KernelCell<Traits, T> {
    type Target = UnsyncTokenLock<T, Keyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for KernelCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<Traits: PortThreading, T: Clone + fmt::Debug> fmt::Debug for KernelCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A dump taken from inside the kernel cannot raise the mask a second
        // time; show the contents only when a token can be had right now
        match acquire::<Traits>() {
            Ok(guard) => {
                let value = self.0.read(&*guard).clone();
                drop(guard);
                write!(f, "KernelCell({value:?})")
            }
            Err(_) => f.write_str("KernelCell(<interrupts masked>)"),
        }
    }
}

/// Raise the interrupt mask and take the cell-access token; the mask drops
/// back when the guard does.
///
/// Fails with `BadContext` if the calling context has the mask raised
/// already — a guard is live further up the call chain, or the application
/// sits inside a critical section.
pub(super) fn acquire<Traits: PortThreading>() -> Result<MaskGuard<Traits>, BadContextError> {
    // Safety: raising the mask is the kernel's own prerogative
    if unsafe { Traits::try_enter_cpu_lock() } {
        // Safety: the mask just went from lowered to raised, so no token for
        // this system type can be live anywhere
        Ok(unsafe { adopt() })
    } else {
        Err(BadContextError::BadContext)
    }
}

/// Materialize a guard for a mask that is already raised, without touching
/// the port.
///
/// # Safety
///
/// Interrupts must really be masked by (or on behalf of) the calling
/// context, and no other guard for this system type may exist — the token
/// must stay unique.
pub(super) unsafe fn adopt<Traits: PortThreading>() -> MaskGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());
    MaskGuard {
        // Safety: token uniqueness is the caller's obligation
        token: unsafe { Token::new_unchecked() },
    }
}

/// Proof that interrupts are masked, carrying the [`KernelCell`] access
/// token.
///
/// Dropping the guard lowers the mask. Forgetting it (`core::mem::forget`)
/// keeps the mask raised past the guard's scope — the critical-section API
/// and the hand-off to `exit_and_dispatch` depend on that.
pub(super) struct MaskGuard<Traits: PortThreading> {
    token: Token<Traits>,
}

impl<Traits: PortThreading> MaskGuard<Traits> {
    /// Reborrow the token for passing down the call chain. A
    /// [`MaskTokenMut`] is not implicitly reborrowed the way `&mut` is, so
    /// every call site spells out the `borrow_mut`; in exchange the token
    /// occupies no memory at all.
    pub(super) fn borrow_mut(&mut self) -> MaskTokenMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for MaskGuard<Traits> {
    fn drop(&mut self) {
        // Safety: the guard's existence proves this context raised the mask
        unsafe { Traits::leave_cpu_lock() };
    }
}

impl<Traits: PortThreading> ops::Deref for MaskGuard<Traits> {
    type Target = Token<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for MaskGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// The borrowed, zero-sized form of [`MaskGuard`]: the token parameter
/// threaded through nearly every internal kernel function.
pub(super) type MaskTokenMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, MaskTag<Traits>>;
