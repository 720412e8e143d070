use super::{Adjudicator, Context};
use crate::state::{State, StateIntent};

/// Payment channels where the payer alone signs each step.
///
/// A step is valid when it is exactly one version after its predecessor, conserves every token total, keeps the
/// allocation layout, and decreases exactly one allocation: that of the participant who signed it. The proofs form a
/// chain whose first element is anchored on the stored state or on a mutually signed state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Remittance;

impl Remittance {
    fn is_valid_step(context: &Context<'_>, previous: &State, next: &State) -> bool {
        if next.intent != StateIntent::Operate
            || next.version != previous.version + 1
            || next.allocations.len() != previous.allocations.len()
        {
            return false;
        }
        let mut payer = None;
        for (index, (before, after)) in previous.allocations.iter().zip(&next.allocations).enumerate() {
            if before.destination != after.destination || before.token != after.token {
                return false;
            }
            if after.amount < before.amount {
                if payer.is_some() {
                    return false;
                }
                payer = Some(index);
            }
        }
        let Some(payer) = payer else {
            return false;
        };
        match (previous.totals(), next.totals()) {
            (Ok(before), Ok(after)) if before == after => {}
            _ => return false,
        }
        context.is_signed_by(next, payer)
    }
}

impl Adjudicator for Remittance {
    fn adjudicate(&self, context: &Context<'_>, candidate: &State, proofs: &[State]) -> bool {
        let (anchor, steps) = match proofs.split_first() {
            None => (context.stored, &[][..]),
            Some((anchor, steps)) => {
                if !context.is_anchor(anchor) {
                    return false;
                }
                (anchor, steps)
            }
        };
        let mut previous = anchor;
        for step in steps.iter().chain(std::iter::once(candidate)) {
            if !Self::is_valid_step(context, previous, step) {
                return false;
            }
            previous = step;
        }
        true
    }
}
