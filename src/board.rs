use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::{BOARD_COLUMNS, BOARD_LENGTH};
use crate::error::GameError;
use crate::types::RedirectKind;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub target: u32,
    pub kind: RedirectKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Coordinates {
    pub row: u32,
    pub column: u32,
}

/// Immutable board layout. Only constructible through [`Board::new`], which
/// rejects self-loops, out-of-range squares, mis-tagged redirects and cycles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Board {
    length: u32,
    columns: u32,
    redirects: BTreeMap<u32, Redirect>,
}

impl Board {
    pub fn new(
        length: u32,
        columns: u32,
        redirects: BTreeMap<u32, Redirect>,
    ) -> Result<Self, GameError> {
        if length < 2 {
            return Err(GameError::board(format!("board length {length} is too small")));
        }
        if columns == 0 {
            return Err(GameError::board("board needs at least one column"));
        }

        for (&origin, redirect) in &redirects {
            if origin == 0 || origin >= length {
                return Err(GameError::board(format!(
                    "redirect origin {origin} outside 1..{length}"
                )));
            }
            if redirect.target == 0 || redirect.target > length {
                return Err(GameError::board(format!(
                    "redirect {origin} targets {} outside 1..={length}",
                    redirect.target
                )));
            }
            if redirect.target == origin {
                return Err(GameError::board(format!("redirect {origin} maps to itself")));
            }
            let direction_ok = match redirect.kind {
                RedirectKind::Ascend => redirect.target > origin,
                RedirectKind::Descend => redirect.target < origin,
            };
            if !direction_ok {
                return Err(GameError::board(format!(
                    "redirect {origin}->{} is tagged {:?} but points the other way",
                    redirect.target, redirect.kind
                )));
            }
        }

        let board = Self {
            length,
            columns,
            redirects,
        };
        board.reject_cycles()?;
        Ok(board)
    }

    /// The stock board players know: ten eels and nine escalators.
    pub fn standard() -> Self {
        let descend = [
            (16, 6, "Giant Eel's Mouth"),
            (47, 26, "Slippery Kelp Forest"),
            (49, 11, "Moray Eel's Lair"),
            (56, 53, "Electric Eel Shock"),
            (62, 19, "Sea Snake Slide"),
            (64, 60, "Jellyfish Sting"),
            (87, 24, "King Neptune's Wrath"),
            (93, 73, "Conger Eel Canyon"),
            (95, 75, "Plankton's Trap"),
            (98, 78, "The Abyss"),
        ];
        let ascend = [
            (1, 38, "Krabby Patty Express"),
            (4, 14, "Bubble Elevator"),
            (9, 21, "SpongeBob's Spatula Lift"),
            (21, 42, "Gary's Shell Escalator"),
            (28, 84, "Patrick's Rock Rocket"),
            (36, 44, "Sandy's Acorn Lift"),
            (51, 67, "Squidward's Clarinet Climb"),
            (71, 91, "Mr. Krabs' Money Tower"),
            (80, 100, "Bikini Bottom Express"),
        ];

        let mut redirects = BTreeMap::new();
        for (kind, table) in [
            (RedirectKind::Descend, &descend[..]),
            (RedirectKind::Ascend, &ascend[..]),
        ] {
            for &(origin, target, name) in table {
                redirects.insert(
                    origin,
                    Redirect {
                        target,
                        kind,
                        name: Some(name.to_string()),
                    },
                );
            }
        }

        Self {
            length: BOARD_LENGTH,
            columns: BOARD_COLUMNS,
            redirects,
        }
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn redirect_at(&self, square: u32) -> Option<&Redirect> {
        self.redirects.get(&square)
    }

    pub fn redirects(&self) -> impl Iterator<Item = (u32, &Redirect)> {
        self.redirects.iter().map(|(origin, redirect)| (*origin, redirect))
    }

    /// Zig-zag layout shared with every renderer: square 1 sits at row 0,
    /// column 0 and odd rows run right to left.
    pub fn coordinates_of(&self, square: u32) -> Option<Coordinates> {
        if square == 0 || square > self.length {
            return None;
        }
        let index = square - 1;
        let row = index / self.columns;
        let offset = index % self.columns;
        let column = if row % 2 == 0 {
            offset
        } else {
            self.columns - 1 - offset
        };
        Some(Coordinates { row, column })
    }

    pub fn square_at(&self, coordinates: Coordinates) -> Option<u32> {
        if coordinates.column >= self.columns {
            return None;
        }
        let offset = if coordinates.row % 2 == 0 {
            coordinates.column
        } else {
            self.columns - 1 - coordinates.column
        };
        let square = coordinates.row * self.columns + offset + 1;
        (square <= self.length).then_some(square)
    }

    fn reject_cycles(&self) -> Result<(), GameError> {
        for &origin in self.redirects.keys() {
            let mut square = origin;
            let mut hops = 0;
            while let Some(redirect) = self.redirects.get(&square) {
                square = redirect.target;
                hops += 1;
                if hops > self.length {
                    return Err(GameError::board(format!(
                        "redirect chain starting at {origin} never settles"
                    )));
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn unchecked(length: u32, redirects: BTreeMap<u32, Redirect>) -> Self {
        Self {
            length,
            columns: BOARD_COLUMNS,
            redirects,
        }
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::standard()
    }
}
