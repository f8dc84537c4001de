//! Per-item state machine.
//!
//! Every id in the residual work set starts `Pending`.  A worker claims it
//! (`InFlight`) and the attempt ends in exactly one terminal state, which is
//! what gets written to the ledger.  There is no edge back out of a terminal
//! state within a run; retries happen on the next invocation.

// ---------------------------------------------------------------------------
// ItemState
// ---------------------------------------------------------------------------

/// States of one dispatched item.
///
/// ```text
/// Pending ──claimed by worker──▶ InFlight ──ok──▶ Succeeded
///                                         ──err─▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemState {
    /// In the work list, not yet claimed.
    #[default]
    Pending,

    /// Claimed by a worker; the endpoint call is in progress.
    InFlight,

    /// The endpoint returned a caption.
    Succeeded,

    /// The attempt failed; a `fail` ledger entry records why.
    Failed,
}

impl ItemState {
    /// `true` for the two states that produce a ledger entry.
    ///
    /// ```
    /// use batch_captioner::pipeline::ItemState;
    ///
    /// assert!(!ItemState::Pending.is_terminal());
    /// assert!(!ItemState::InFlight.is_terminal());
    /// assert!(ItemState::Succeeded.is_terminal());
    /// assert!(ItemState::Failed.is_terminal());
    /// ```
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Succeeded | ItemState::Failed)
    }

    pub fn can_transition_to(&self, next: ItemState) -> bool {
        matches!(
            (self, next),
            (ItemState::Pending, ItemState::InFlight)
                | (ItemState::InFlight, ItemState::Succeeded)
                | (ItemState::InFlight, ItemState::Failed)
        )
    }

    /// Short label used in debug logs.
    pub fn label(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::InFlight => "in-flight",
            ItemState::Succeeded => "ok",
            ItemState::Failed => "fail",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
