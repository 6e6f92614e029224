//! The abstract-interpretation state behind every emitted instruction
//!
//! All opcode handlers, however different their preconditions, funnel through
//! [`VerifierState::update_state`]: pop what the opcode pops (checking assignability slot by
//! slot), push what it pushes, log the instruction, and do the branch bookkeeping. Keeping one
//! choke-point is what makes the invariants checkable in one place - no handler can sneak a stack
//! effect past the verifier.

use crate::cil::buffer::InstructionBuffer;
use crate::cil::emit::scopes::ScopeTable;
use crate::cil::errors::{Error, ErrorKind};
use crate::cil::host::HostEmitter;
use crate::cil::instruction::{
    BranchTarget, Instruction, InstructionIndex, LabelId, Opcode, Operand,
};
use crate::cil::metadata::Assignable;
use crate::cil::stack::{AbstractStack, StackIdentity};
use crate::cil::types::{CilType, StackType};
use crate::util::Offset;
use std::collections::HashMap;

/// A jump target token handed to the caller
///
/// A label is defined from creation and marked at most once; branches to it may come before or
/// after the mark. The token is only meaningful to the emitter that created it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Label {
    pub(crate) id: LabelId,
    pub(crate) owner: u64,
}

/// A local-variable token handed to the caller
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Local {
    pub(crate) index: u16,
    pub(crate) owner: u64,
}

pub(crate) struct LabelData<'g> {
    pub name: Option<String>,

    /// Stack shape every path into this label must have; set by the first branch or the mark
    pub required_stack: Option<AbstractStack<'g>>,

    /// Where the label was marked, once it has been
    pub marked_at: Option<(InstructionIndex, Offset)>,

    /// Branches recorded against this label, for diagnostics
    pub incoming: Vec<InstructionIndex>,
}

pub(crate) struct LocalData<'g> {
    pub name: Option<String>,
    pub ty: CilType<'g>,

    /// Set on the first store; loads before that are rejected
    pub initialized: bool,
}

struct PendingPatch {
    instruction: InstructionIndex,

    /// Which switch-table slot to patch; `None` for plain branch operands
    slot: Option<usize>,

    label: LabelId,
}

/// Mutable verification state of one method body under construction
pub(crate) struct VerifierState<'g> {
    pub stack: AbstractStack<'g>,
    pub max_stack: usize,
    labels: Vec<LabelData<'g>>,
    pub locals: Vec<LocalData<'g>>,
    pub args: Vec<CilType<'g>>,
    pub scopes: ScopeTable<'g>,
    pending_patches: Vec<PendingPatch>,

    /// Which stack shape flowed into which label, keyed by shape identity
    branches_by_stack: HashMap<StackIdentity, (LabelId, InstructionIndex)>,
}

impl<'g> VerifierState<'g> {
    pub fn new(args: Vec<CilType<'g>>) -> VerifierState<'g> {
        VerifierState {
            stack: AbstractStack::root(),
            max_stack: 0,
            labels: vec![],
            locals: vec![],
            args,
            scopes: ScopeTable::new(),
            pending_patches: vec![],
            branches_by_stack: HashMap::new(),
        }
    }

    /// Attach the failure context every error carries
    pub fn fail<H: HostEmitter<'g>>(
        &self,
        buffer: &InstructionBuffer<'g, H>,
        kind: ErrorKind,
    ) -> Error {
        Error {
            kind,
            instruction: buffer.len(),
            stack: self.stack.render(),
        }
    }

    pub fn define_label(&mut self, name: Option<String>) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(LabelData {
            name,
            required_stack: None,
            marked_at: None,
            incoming: vec![],
        });
        id
    }

    pub fn label(&self, id: LabelId) -> &LabelData<'g> {
        &self.labels[id.0 as usize]
    }

    /// Render a label for diagnostics: its name if it has one, else `L<id>`
    pub fn label_name(&self, id: LabelId) -> String {
        match &self.labels[id.0 as usize].name {
            Some(name) => name.clone(),
            None => format!("L{}", id.0),
        }
    }

    /// Compose the operand for a branch whose instruction will be `width` bytes wide
    ///
    /// If the target is already marked the final relative offset is written immediately;
    /// otherwise a placeholder goes out and [`VerifierState::mark_label`] patches it later.
    pub fn branch_target<H: HostEmitter<'g>>(
        &self,
        buffer: &InstructionBuffer<'g, H>,
        label: LabelId,
        width: usize,
    ) -> BranchTarget {
        match self.labels[label.0 as usize].marked_at {
            Some((_, target_offset)) => {
                let source_end = buffer.current_offset() + width;
                BranchTarget::Resolved((target_offset - source_end) as i32)
            }
            None => BranchTarget::Pending(label),
        }
    }

    /// The single state-update primitive
    ///
    /// `expected_pops` is in pop order (top of stack first); `pushed` is in push order (last
    /// element ends up on top). On success the instruction has been verified, logged, and its
    /// bytes handed to the host.
    pub fn update_state<H: HostEmitter<'g>>(
        &mut self,
        buffer: &mut InstructionBuffer<'g, H>,
        insn: Instruction<'g>,
        expected_pops: &[StackType<'g>],
        pushed: &[StackType<'g>],
    ) -> Result<InstructionIndex, Error> {
        // 1. Enough operands?
        let actuals = self.stack.top_n(expected_pops.len()).ok_or_else(|| {
            self.fail(
                buffer,
                ErrorKind::StackUnderflow {
                    required: expected_pops.len(),
                    have: self.stack.depth(),
                },
            )
        })?;

        // 2. Operands pop in reverse of the order they were pushed; check each slot
        for (position, (actual, expected)) in actuals.iter().zip(expected_pops).enumerate() {
            if !actual.is_assignable(expected) {
                log::error!(
                    "{}: found {} but expected {} (stack position {})",
                    insn.opcode.mnemonic(),
                    actual,
                    expected,
                    position
                );
                return Err(self.fail(
                    buffer,
                    ErrorKind::TypeMismatch {
                        opcode: insn.opcode.mnemonic(),
                        position,
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    },
                ));
            }
        }

        // 3. Branches must agree with the stack shape already recorded for their target
        let branch_targets = Self::operand_targets(&insn.operand);
        if insn.opcode.is_branch() {
            let (after_pops, _) = self
                .stack
                .pop_n(expected_pops.len())
                .expect("checked by top_n above");
            // `leave` empties the evaluation stack on its way out
            let flowing = if insn.opcode == Opcode::Leave {
                AbstractStack::root()
            } else {
                after_pops
            };
            for (_, label) in &branch_targets {
                self.require_stack_at(buffer, *label, &flowing)?;
            }
        }

        // 4. Update the stack and log the instruction
        let (mut stack, _) = self
            .stack
            .pop_n(expected_pops.len())
            .expect("checked by top_n above");
        stack = stack.push_all(pushed);
        self.max_stack = self.max_stack.max(stack.depth());
        let is_terminator = insn.opcode.is_terminator();
        let is_leave = insn.opcode == Opcode::Leave;
        let index = buffer.append(insn);

        // 5. Record branch bookkeeping and forward patches
        if !branch_targets.is_empty() {
            let flowing = if is_leave {
                AbstractStack::root()
            } else {
                stack.clone()
            };
            for (slot, label) in branch_targets {
                self.branches_by_stack
                    .insert(flowing.unique(), (label, index));
                self.labels[label.0 as usize].incoming.push(index);
                if self.labels[label.0 as usize].marked_at.is_none() {
                    self.pending_patches.push(PendingPatch {
                        instruction: index,
                        slot,
                        label,
                    });
                }
            }
        }

        // Nothing falls through a terminator; the stream continues at a root stack
        self.stack = if is_terminator {
            AbstractStack::root()
        } else {
            stack
        };

        Ok(index)
    }

    /// Pending labels inside an operand, with their switch-table slot when applicable
    fn operand_targets(operand: &Operand<'g>) -> Vec<(Option<usize>, LabelId)> {
        match operand {
            Operand::Target(BranchTarget::Pending(label)) => vec![(None, *label)],
            Operand::Target(BranchTarget::Resolved(_)) => vec![],
            Operand::Switch(targets) => targets
                .iter()
                .enumerate()
                .filter_map(|(slot, target)| match target {
                    BranchTarget::Pending(label) => Some((Some(slot), *label)),
                    BranchTarget::Resolved(_) => None,
                })
                .collect(),
            _ => vec![],
        }
    }

    /// Check (or record) the stack shape required at a label
    fn require_stack_at<H: HostEmitter<'g>>(
        &mut self,
        buffer: &InstructionBuffer<'g, H>,
        label: LabelId,
        flowing: &AbstractStack<'g>,
    ) -> Result<(), Error> {
        let name = self.label_name(label);
        let data = &mut self.labels[label.0 as usize];
        match &data.required_stack {
            Some(required) if required != flowing => Err(Error {
                kind: ErrorKind::LabelError {
                    reason: format!(
                        "stack at branch disagrees with the label's required shape: have {:?}, required {:?}",
                        flowing, required
                    ),
                    label: name,
                },
                instruction: buffer.len(),
                stack: self.stack.render(),
            }),
            Some(_) => Ok(()),
            None => {
                data.required_stack = Some(flowing.clone());
                Ok(())
            }
        }
    }

    /// Resolved-branch agreement for targets that were already marked
    ///
    /// A backward branch writes its final offset immediately, so it never registers a patch; its
    /// stack must still agree with the shape recorded at the mark. Handlers call this with the
    /// stack that flows along the edge.
    pub fn check_marked_target<H: HostEmitter<'g>>(
        &mut self,
        buffer: &InstructionBuffer<'g, H>,
        label: LabelId,
        flowing: &AbstractStack<'g>,
    ) -> Result<(), Error> {
        self.require_stack_at(buffer, label, flowing)
    }

    /// Book a branch edge whose operand was already resolved at append time
    pub fn record_resolved_branch(
        &mut self,
        label: LabelId,
        index: InstructionIndex,
        flowing: &AbstractStack<'g>,
    ) {
        self.branches_by_stack
            .insert(flowing.unique(), (label, index));
        self.labels[label.0 as usize].incoming.push(index);
    }

    /// Bind a label to the current position
    pub fn mark_label<H: HostEmitter<'g>>(
        &mut self,
        buffer: &mut InstructionBuffer<'g, H>,
        label: LabelId,
    ) -> Result<(), Error> {
        let name = self.label_name(label);
        if self.labels[label.0 as usize].marked_at.is_some() {
            return Err(self.fail(
                buffer,
                ErrorKind::LabelError {
                    reason: String::from("label is already marked"),
                    label: name,
                },
            ));
        }

        // Incoming branches fixed the shape this position must have
        match &self.labels[label.0 as usize].required_stack {
            Some(required) if *required != self.stack => {
                let kind = ErrorKind::LabelError {
                    reason: format!(
                        "stack at mark differs from incoming branch: have {:?}, required {:?}",
                        required, self.stack
                    ),
                    label: name,
                };
                return Err(self.fail(buffer, kind));
            }
            Some(_) => {}
            None => {
                self.labels[label.0 as usize].required_stack = Some(self.stack.clone());
            }
        }

        let mark_offset = buffer.current_offset();
        self.labels[label.0 as usize].marked_at = Some((buffer.next_index(), mark_offset));

        // Backpatch every forward branch that was waiting on this label
        let ready: Vec<PendingPatch> = {
            let mut ready = vec![];
            let mut waiting = vec![];
            for patch in self.pending_patches.drain(..) {
                if patch.label == label {
                    ready.push(patch);
                } else {
                    waiting.push(patch);
                }
            }
            self.pending_patches = waiting;
            ready
        };
        for patch in ready {
            let insn = buffer.instruction(patch.instruction);
            let source_end = buffer.offset_of(patch.instruction) + insn.width();
            let relative = (mark_offset - source_end) as i32;
            let operand = match (&insn.operand, patch.slot) {
                (Operand::Target(_), None) => Operand::Target(BranchTarget::Resolved(relative)),
                (Operand::Switch(targets), Some(slot)) => {
                    let mut targets = targets.clone();
                    targets[slot] = BranchTarget::Resolved(relative);
                    Operand::Switch(targets)
                }
                _ => unreachable!("patch registered for a non-branch operand"),
            };
            buffer.patch(patch.instruction, operand);
        }

        Ok(())
    }

    /// Labels that were never marked, rendered for the finalization error
    pub fn unmarked_labels(&self) -> Vec<String> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, data)| data.marked_at.is_none())
            .map(|(id, _)| self.label_name(LabelId(id as u32)))
            .collect()
    }

    /// No patch may survive finalization
    pub fn patches_resolved(&self) -> bool {
        self.pending_patches.is_empty()
    }

    /// How many distinct stack shapes have flowed into branches (diagnostic surface)
    pub fn recorded_branch_shapes(&self) -> usize {
        self.branches_by_stack.len()
    }
}
