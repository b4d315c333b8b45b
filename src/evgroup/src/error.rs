//! Error types
//!
//! Programming errors (passing a mask that intersects
//! [`EVENT_BITS_CONTROL_BYTES`], waiting for nothing, blocking while the
//! scheduler isn't running) are not represented here. They are caught by
//! assertions and cause a panic.
//!
//! [`EVENT_BITS_CONTROL_BYTES`]: crate::EVENT_BITS_CONTROL_BYTES
use core::{fmt, mem::transmute};

use crate::EventGroupBits;

/// All result codes (including success) produced by the engine.
///
/// The discriminants follow the closest equivalents in μITRON4.0.
#[repr(i8)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResultCode {
    /// The operation was successful.
    Success = 0,
    /// There isn't enough memory to complete the operation.
    NoMemory = -33,
    /// A queue has reached its capacity.
    QueueOverflow = -43,
    /// The operation timed out.
    Timeout = -50,
}

impl ResultCode {
    /// Get the short name of the result code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::NoMemory => "NoMemory",
            Self::QueueOverflow => "QueueOverflow",
            Self::Timeout => "Timeout",
        }
    }

    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        impl<T> From<Result<T, $name>> for ResultCode {
            #[inline]
            fn from(x: Result<T, $name>) -> Self {
                match x {
                    Ok(_) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                    assert!(ResultCode::from(Err::<(), _>($name::$vname)).is_err());
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }
    };
}

define_error! {
    mod create_event_group_error {}
    /// Error type for [`EventGroup::new`].
    ///
    /// [`EventGroup::new`]: crate::EventGroup::new
    pub enum CreateEventGroupError {
        /// The port's allocator couldn't provide memory for the event group.
        NoMemory,
    }
}

define_error! {
    mod pend_call_error {}
    /// Error type for [`EventGroup::set_from_isr`] and
    /// [`EventGroup::clear_from_isr`].
    ///
    /// [`EventGroup::set_from_isr`]: crate::EventGroup::set_from_isr
    /// [`EventGroup::clear_from_isr`]: crate::EventGroup::clear_from_isr
    pub enum PendCallError {
        /// The deferred call queue is full. The request was dropped.
        QueueOverflow,
    }
}

/// Error type for [`EventGroup::wait`] and [`EventGroup::sync`], returned when
/// the condition wasn't met within the timeout.
///
/// [`EventGroup::wait`]: crate::EventGroup::wait
/// [`EventGroup::sync`]: crate::EventGroup::sync
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitTimeout {
    /// The event bits observed when the wait ended.
    pub bits: EventGroupBits,
}

impl fmt::Debug for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitTimeout")
            .field("bits", &format_args!("{:#x}", self.bits))
            .finish()
    }
}

impl From<WaitTimeout> for ResultCode {
    #[inline]
    fn from(_: WaitTimeout) -> Self {
        Self::Timeout
    }
}
