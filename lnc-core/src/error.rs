//! Classification shared by every error a channel operation can return.
//!
//! Each protocol step has its own error enum that wraps the errors of the layers below it.
//! Callers use the classification to choose between force-closing, retrying and logging.

use bitcoin::secp256k1;

use crate::commitments::CommitmentsError;
use crate::persist;

/// Capabilities of every channel error
pub trait ClassifiedError: std::error::Error {
    /// Human readable description, suitable for an `error` message to the peer
    fn message(&self) -> String {
        self.to_string()
    }

    /// The channel cannot continue and should be force-closed
    fn channel_breakdown(&self) -> bool;

    /// The failure may come from a bug on our side rather than from the peer or the environment.
    /// Only used for diagnostics.
    fn possible_bug(&self) -> bool;
}

/// When raised by our own proposal, a [CommitmentsError] is an expected refusal, except for
/// the variants that can only come from a local state machine error
impl ClassifiedError for CommitmentsError {
    fn channel_breakdown(&self) -> bool {
        false
    }

    fn possible_bug(&self) -> bool {
        matches!(
            self,
            CommitmentsError::CannotSignWithoutChanges
                | CommitmentsError::CannotSignBeforeRevocation
                | CommitmentsError::UnexpectedRevocation
                | CommitmentsError::Crypto(_)
        )
    }
}

impl ClassifiedError for persist::Error {
    fn channel_breakdown(&self) -> bool {
        false
    }

    fn possible_bug(&self) -> bool {
        matches!(self, persist::Error::Internal(_) | persist::Error::AlreadyExists(_))
    }
}

impl ClassifiedError for lnc_protocol::error::Error {
    fn channel_breakdown(&self) -> bool {
        true
    }

    fn possible_bug(&self) -> bool {
        false
    }
}

impl ClassifiedError for secp256k1::Error {
    fn channel_breakdown(&self) -> bool {
        false
    }

    fn possible_bug(&self) -> bool {
        true
    }
}

/// Implements [ClassifiedError] for a step error.
///
/// Variants listed as `wrapped` forward to the inner error. The others are classified by
/// the `breakdown` and `bug` lists.
macro_rules! classified_error {
    (
        $name:ident,
        wrapped: [$($wrapped:ident),* $(,)?],
        breakdown: [$($breakdown:ident),* $(,)?],
        bug: [$($bug:ident),* $(,)?] $(,)?
    ) => {
        impl $crate::error::ClassifiedError for $name {
            #[allow(unreachable_patterns)]
            fn channel_breakdown(&self) -> bool {
                match self {
                    $($name::$wrapped(inner) => $crate::error::ClassifiedError::channel_breakdown(inner),)*
                    $($name::$breakdown { .. } => true,)*
                    _ => false,
                }
            }

            #[allow(unreachable_patterns)]
            fn possible_bug(&self) -> bool {
                match self {
                    $($name::$wrapped(inner) => $crate::error::ClassifiedError::possible_bug(inner),)*
                    $($name::$bug { .. } => true,)*
                    _ => false,
                }
            }
        }
    };
}

pub(crate) use classified_error;
