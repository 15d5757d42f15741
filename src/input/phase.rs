use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PointerPhase {
    Hover,
    Down,
    #[default]
    Move,
    Up,
    Cancel,
}

/// What the drawing engine should do with a routed pointer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Begin,
    Extend,
    Commit,
    Cancel,
    Ignore,
}

/// Routes pointer phases to stroke entry points.
///
/// Only one pointer owns the stroke at a time; events from any other pointer
/// are ignored until the owner lifts or cancels. Moves with no owner are
/// hover traffic and never start a stroke.
#[derive(Debug, Default)]
pub struct StrokeGate {
    owner: Option<u32>,
}

impl StrokeGate {
    pub fn new() -> Self {
        Self { owner: None }
    }

    pub fn owner(&self) -> Option<u32> {
        self.owner
    }

    pub fn reset(&mut self) {
        self.owner = None;
    }

    pub fn resolve(&mut self, pointer_id: u32, phase: PointerPhase) -> GateAction {
        match (self.owner, phase) {
            (_, PointerPhase::Hover) => GateAction::Ignore,
            (None, PointerPhase::Down) => {
                self.owner = Some(pointer_id);
                GateAction::Begin
            }
            (None, PointerPhase::Move) => GateAction::Ignore,
            (None, PointerPhase::Up | PointerPhase::Cancel) => GateAction::Ignore,
            (Some(owner), _) if owner != pointer_id => GateAction::Ignore,
            // A second Down from the owner means the Up was lost: restart
            (Some(_), PointerPhase::Down) => GateAction::Begin,
            (Some(_), PointerPhase::Move) => GateAction::Extend,
            (Some(_), PointerPhase::Up) => {
                self.owner = None;
                GateAction::Commit
            }
            (Some(_), PointerPhase::Cancel) => {
                self.owner = None;
                GateAction::Cancel
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn down_move_up_sequence_keeps_single_stroke() {
        let mut gate = StrokeGate::new();

        assert_eq!(gate.resolve(1, PointerPhase::Hover), GateAction::Ignore);
        assert_eq!(gate.resolve(1, PointerPhase::Down), GateAction::Begin);
        assert_eq!(gate.owner(), Some(1));
        assert_eq!(gate.resolve(1, PointerPhase::Move), GateAction::Extend);
        assert_eq!(gate.resolve(1, PointerPhase::Up), GateAction::Commit);
        assert_eq!(gate.owner(), None);
    }

    #[test]
    fn second_pointer_is_ignored_while_stroke_is_active() {
        let mut gate = StrokeGate::new();

        assert_eq!(gate.resolve(1, PointerPhase::Down), GateAction::Begin);
        assert_eq!(gate.resolve(2, PointerPhase::Down), GateAction::Ignore);
        assert_eq!(gate.resolve(2, PointerPhase::Move), GateAction::Ignore);
        assert_eq!(gate.resolve(2, PointerPhase::Up), GateAction::Ignore);
        assert_eq!(gate.resolve(1, PointerPhase::Move), GateAction::Extend);
        assert_eq!(gate.resolve(1, PointerPhase::Up), GateAction::Commit);

        assert_eq!(gate.resolve(2, PointerPhase::Down), GateAction::Begin);
    }

    #[test]
    fn cancel_releases_ownership() {
        let mut gate = StrokeGate::new();

        gate.resolve(4, PointerPhase::Down);
        assert_eq!(gate.resolve(4, PointerPhase::Cancel), GateAction::Cancel);
        assert_eq!(gate.owner(), None);
        assert_eq!(gate.resolve(4, PointerPhase::Move), GateAction::Ignore);
    }
}
