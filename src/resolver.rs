use crate::board::Board;
use crate::error::GameError;
use crate::types::{EffectKind, MoveEffect, RedirectStep};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub final_square: u32,
    pub chain: Vec<RedirectStep>,
    pub won: bool,
}

impl Resolution {
    pub fn effect_kind(&self) -> EffectKind {
        if self.won {
            return EffectKind::Win;
        }
        self.chain
            .last()
            .map(|step| EffectKind::from(step.kind))
            .unwrap_or(EffectKind::Normal)
    }

    pub fn effect(&self) -> MoveEffect {
        MoveEffect {
            kind: self.effect_kind(),
            detail: self.chain.clone(),
        }
    }
}

/// Moves `step` squares from `start`, clamps at the final square, then follows
/// redirects until one no longer applies.
///
/// Landing directly on the final square wins without consulting redirects.
/// A chain longer than the board itself can only come from a cyclic table and
/// fails instead of spinning.
pub fn resolve(board: &Board, start: u32, step: u32) -> Result<Resolution, GameError> {
    let length = board.length();
    if start > length {
        return Err(GameError::board(format!(
            "start square {start} is beyond the board length {length}"
        )));
    }
    if step == 0 {
        return Err(GameError::InvalidStep { step });
    }

    let mut landed = start.saturating_add(step).min(length);
    let mut chain: Vec<RedirectStep> = Vec::new();

    if landed < length {
        while let Some(redirect) = board.redirect_at(landed) {
            if chain.len() as u32 >= length {
                return Err(GameError::board(format!(
                    "redirect chain from square {} does not terminate",
                    chain
                        .first()
                        .map(|entry| entry.origin)
                        .unwrap_or(landed)
                )));
            }
            chain.push(RedirectStep {
                kind: redirect.kind,
                origin: landed,
                target: redirect.target,
            });
            landed = redirect.target;
            if landed >= length {
                break;
            }
        }
    }

    Ok(Resolution {
        final_square: landed,
        chain,
        won: landed == length,
    })
}
