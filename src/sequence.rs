use crate::errors::StreamError;

/// Outcome of checking one incoming sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    Accepted,
    Gap { expected: u64, received: u64 },
}

impl SequenceCheck {
    pub fn is_accepted(self) -> bool {
        matches!(self, SequenceCheck::Accepted)
    }

    pub fn into_result(self) -> Result<(), StreamError> {
        match self {
            SequenceCheck::Accepted => Ok(()),
            SequenceCheck::Gap { expected, received } => {
                Err(StreamError::SequenceGap { expected, received })
            }
        }
    }
}

/// Validates per-connection sequence ids.
///
/// The caller owns `last_seen` and threads it through every call; the guard
/// keeps no state of its own. A gap leaves `last_seen` untouched and the
/// stream is considered unrecoverable until a fresh snapshot arrives on a new
/// subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceGuard;

impl SequenceGuard {
    pub fn check(last_seen: &mut Option<u64>, incoming: u64) -> SequenceCheck {
        if let Some(previous) = *last_seen {
            let expected = previous.wrapping_add(1);
            if incoming != expected {
                return SequenceCheck::Gap {
                    expected,
                    received: incoming,
                };
            }
        }
        *last_seen = Some(incoming);
        SequenceCheck::Accepted
    }
}
