//! Try/catch/finally frames on the verifier's scope stack
//!
//! Frames form a LIFO discipline but relate to each other by id: a handler remembers which try it
//! belongs to, and the try counts the handlers attached to it. Keeping the relations as id pairs
//! into one table (instead of owning references) means closure order never fights the borrow
//! checker, and closed frames stay around for diagnostics.

use crate::cil::instruction::{InstructionIndex, LabelId};
use crate::cil::metadata::TypeId;

/// Index of a frame in the scope table
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct ScopeId(usize);

#[derive(Debug)]
pub(crate) enum ScopeKind<'g> {
    Try {
        /// Label just past the whole region; `leave` from handlers targets it
        end_label: LabelId,

        /// Number of catch/finally handlers attached so far
        handlers: usize,

        /// At most one finally handler per try
        has_finally: bool,
    },
    Catch {
        parent: ScopeId,
        caught: TypeId<'g>,
    },
    Finally {
        parent: ScopeId,
    },
}

#[derive(Debug)]
pub(crate) struct ScopeFrame<'g> {
    pub kind: ScopeKind<'g>,
    pub opened_at: InstructionIndex,
    pub closed_at: Option<InstructionIndex>,
}

/// All scope frames ever opened, plus the stack of currently open ones
#[derive(Default)]
pub(crate) struct ScopeTable<'g> {
    frames: Vec<ScopeFrame<'g>>,
    open: Vec<ScopeId>,
}

impl<'g> ScopeTable<'g> {
    pub fn new() -> ScopeTable<'g> {
        ScopeTable {
            frames: vec![],
            open: vec![],
        }
    }

    pub fn open(&mut self, kind: ScopeKind<'g>, at: InstructionIndex) -> ScopeId {
        let id = ScopeId(self.frames.len());
        self.frames.push(ScopeFrame {
            kind,
            opened_at: at,
            closed_at: None,
        });
        self.open.push(id);
        id
    }

    /// The frame a new instruction lands in, if any
    pub fn innermost(&self) -> Option<ScopeId> {
        self.open.last().copied()
    }

    /// Close the innermost frame; the caller has already checked it is the right one
    pub fn close_innermost(&mut self, at: InstructionIndex) {
        if let Some(id) = self.open.pop() {
            self.frames[id.0].closed_at = Some(at);
        }
    }

    pub fn frame(&self, id: ScopeId) -> &ScopeFrame<'g> {
        &self.frames[id.0]
    }

    pub fn frame_mut(&mut self, id: ScopeId) -> &mut ScopeFrame<'g> {
        &mut self.frames[id.0]
    }

    /// Is any catch handler open, walking out from the innermost frame?
    pub fn inside_catch(&self) -> bool {
        self.open
            .iter()
            .rev()
            .any(|id| matches!(self.frames[id.0].kind, ScopeKind::Catch { .. }))
    }

    pub fn all_closed(&self) -> bool {
        self.open.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Human-readable description of a frame, for scope errors
    pub fn describe(&self, id: ScopeId) -> String {
        let frame = &self.frames[id.0];
        let what = match frame.kind {
            ScopeKind::Try { .. } => "try",
            ScopeKind::Catch { .. } => "catch",
            ScopeKind::Finally { .. } => "finally",
        };
        match frame.closed_at {
            Some(at) => format!(
                "{} opened at instruction #{}, closed at #{}",
                what, frame.opened_at.0, at.0
            ),
            None => format!("{} opened at instruction #{}", what, frame.opened_at.0),
        }
    }

    /// Description of the innermost open frame, or of the whole (empty) scope stack
    pub fn describe_innermost(&self) -> String {
        match self.innermost() {
            Some(id) => self.describe(id),
            None => String::from("no open protected region"),
        }
    }
}
