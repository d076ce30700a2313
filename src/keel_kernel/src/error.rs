//! Error codes returned by kernel operations.
//!
//! Every fallible operation has its own error enum listing exactly the kinds
//! it can produce; the discriminants are shared with [`ResultCode`] so a
//! C-style façade can collapse any of them into one numeric code.
use core::fmt;

/// All error kinds the kernel can surface, with stable numeric values.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    Success = 0,
    /// A dynamic creation failed because the allocator was exhausted.
    NoMemory = -1,
    /// A parameter was out of its permitted domain.
    BadParam = -2,
    /// The operation is not permitted in the calling context.
    BadContext = -3,
    /// The object was not in a state that permits the operation.
    BadObjectState = -4,
    /// A blocking operation exceeded its timeout.
    Timeout = -5,
    /// A non-blocking attempt could not complete immediately.
    WouldBlock = -6,
    /// Acquiring the lock would deadlock the caller on itself.
    WouldDeadlock = -7,
    /// An unlock was attempted by a task that does not hold the lock.
    NotOwner = -8,
    /// A blocking operation was forcibly interrupted.
    Aborted = -9,
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as i8 ),*
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }
    };
}

/// Generate `From<$Sub> for $Super` for single-variant internal errors, so
/// `?` can widen them into any public enum carrying the same kind.
macro_rules! impl_sub_error {
    ( $Sub:ident :: $Variant:ident => $( $Super:ident ),* $(,)? ) => {
        $(
            impl From<$Sub> for $Super {
                #[inline]
                fn from(_: $Sub) -> Self {
                    Self::$Variant
                }
            }
        )*
    };
}

define_error! {
    /// `BadContext`
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_error! {
    /// `BadParam`
    pub(crate) enum BadParamError {
        BadParam,
    }
}

define_error! {
    /// `NoMemory`
    pub(crate) enum NoMemoryError {
        NoMemory,
    }
}

define_error! {
    /// The outcome of a blocking wait, written by whatever ends the wait.
    pub enum WaitTimeoutError {
        Timeout,
        Aborted,
    }
}

define_error! {
    /// Error type for dynamic and static object creation.
    pub enum CreateError {
        NoMemory,
        BadParam,
        BadContext,
    }
}

define_error! {
    /// Error type for `delay` and `delay_until`.
    pub enum SleepError {
        BadContext,
        BadParam,
        Aborted,
    }
}

define_error! {
    /// Error type for operations that only require a sane calling context.
    pub enum BadContextOnlyError {
        BadContext,
    }
}

define_error! {
    /// Error type for `set_task_priority` / `task_priority`.
    pub enum SetTaskPriorityError {
        BadContext,
        BadParam,
        BadObjectState,
    }
}

define_error! {
    /// Error type for `suspend_task` / `resume_task` / `delete_task`.
    pub enum TaskStateError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for `abort_delay`.
    pub enum AbortDelayError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for blocking queue sends and receives.
    pub enum QueueTransferError {
        Timeout,
        Aborted,
        BadContext,
        BadParam,
    }
}

define_error! {
    /// Error type for non-blocking queue sends and receives.
    pub enum QueueTryTransferError {
        WouldBlock,
        BadContext,
        BadParam,
    }
}

define_error! {
    /// Error type for `delete_queue` and friends.
    pub enum DeleteError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for semaphore waits and `notify_take` / `notify_wait`.
    pub enum WaitError {
        Timeout,
        Aborted,
        BadContext,
    }
}

define_error! {
    /// Error type for non-blocking semaphore acquisition.
    pub enum PollError {
        WouldBlock,
        BadContext,
    }
}

define_error! {
    /// Error type for semaphore signalling.
    pub enum SignalError {
        WouldBlock,
        BadContext,
    }
}

define_error! {
    /// Error type for blocking mutex acquisition.
    pub enum LockMutexError {
        Timeout,
        Aborted,
        WouldDeadlock,
        BadContext,
    }
}

define_error! {
    /// Error type for non-blocking mutex acquisition.
    pub enum TryLockMutexError {
        WouldBlock,
        WouldDeadlock,
        BadContext,
    }
}

define_error! {
    /// Error type for mutex release.
    pub enum UnlockMutexError {
        NotOwner,
        BadContext,
    }
}

define_error! {
    /// Error type for `notify`.
    pub enum NotifyError {
        WouldBlock,
        BadContext,
    }
}

define_error! {
    /// Error type for posting a command to the timer daemon.
    pub enum TimerCommandError {
        Timeout,
        Aborted,
        BadContext,
        BadObjectState,
    }
}

impl_sub_error! {
    BadContextError::BadContext =>
        CreateError, SleepError, BadContextOnlyError, SetTaskPriorityError,
        TaskStateError, AbortDelayError, QueueTransferError,
        QueueTryTransferError, DeleteError, WaitError, PollError, SignalError,
        LockMutexError, TryLockMutexError, UnlockMutexError, NotifyError,
        TimerCommandError,
}

impl_sub_error! {
    BadParamError::BadParam =>
        CreateError, SetTaskPriorityError, QueueTransferError,
        QueueTryTransferError,
}

impl_sub_error! {
    NoMemoryError::NoMemory => CreateError,
}

impl From<WaitTimeoutError> for QueueTransferError {
    #[inline]
    fn from(x: WaitTimeoutError) -> Self {
        match x {
            WaitTimeoutError::Timeout => Self::Timeout,
            WaitTimeoutError::Aborted => Self::Aborted,
        }
    }
}

impl From<WaitTimeoutError> for WaitError {
    #[inline]
    fn from(x: WaitTimeoutError) -> Self {
        match x {
            WaitTimeoutError::Timeout => Self::Timeout,
            WaitTimeoutError::Aborted => Self::Aborted,
        }
    }
}

impl From<WaitTimeoutError> for LockMutexError {
    #[inline]
    fn from(x: WaitTimeoutError) -> Self {
        match x {
            WaitTimeoutError::Timeout => Self::Timeout,
            WaitTimeoutError::Aborted => Self::Aborted,
        }
    }
}
