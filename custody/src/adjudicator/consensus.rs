use super::{Adjudicator, Context};
use crate::state::{State, StateIntent};

/// Accepts OPERATE states every participant signed, as long as they conserve the per-token totals of their
/// predecessor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Consensus;

impl Adjudicator for Consensus {
    fn adjudicate(&self, context: &Context<'_>, candidate: &State, proofs: &[State]) -> bool {
        if candidate.intent != StateIntent::Operate {
            return false;
        }
        let previous = match proofs {
            [] => context.stored,
            [proof] if context.is_anchor(proof) => proof,
            _ => return false,
        };
        if candidate.version <= previous.version {
            return false;
        }
        match (candidate.totals(), previous.totals()) {
            (Ok(candidate_totals), Ok(previous_totals)) if candidate_totals == previous_totals => {}
            _ => return false,
        }
        context.is_signed_by_all(candidate)
    }
}
