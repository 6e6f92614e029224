//! Boundary to the runtime that materializes verified streams
//!
//! The verifier does not own byte layout or delegate creation; it drives a [`HostEmitter`] and
//! trusts it to write opcodes, track native offsets, and eventually hand back something callable.
//! [`BytecodeHost`] is the plain in-memory implementation: it assembles the byte stream and the
//! exception-region table and returns them as an inert [`MethodBody`]. A real JIT host would
//! implement the same trait against its own code heap.

use crate::cil::metadata::TypeId;
use crate::cil::types::CilType;
use crate::util::Offset;

/// What the host must provide to back an emitter
pub trait HostEmitter<'g> {
    /// Whatever "callable" the host produces at finalization
    type Delegate;

    /// Append encoded opcode bytes at the current offset
    fn append_opcode(&mut self, encoding: &[u8]);

    /// Append operand bytes at the current offset
    fn append_operand(&mut self, bytes: &[u8]);

    /// Overwrite previously appended bytes (forward-branch backpatching)
    fn patch(&mut self, offset: Offset, bytes: &[u8]);

    /// Offset the next appended byte will land at
    fn current_offset(&self) -> Offset;

    /// Open a protected region at the current offset
    fn begin_try(&mut self);

    /// Close the protected region (or the previous handler) and open a typed handler
    fn begin_catch(&mut self, catch_type: TypeId<'g>);

    /// Close the protected region (or the previous handler) and open a finally handler
    fn begin_finally(&mut self);

    /// Close the open handler and seal the region
    fn end_try(&mut self);

    /// Produce the delegate; the emitter guarantees it calls this at most once
    fn finalize(
        &mut self,
        return_type: Option<CilType<'g>>,
        locals: Vec<CilType<'g>>,
        max_stack: usize,
    ) -> Self::Delegate;
}

/// Handler half of an exception region
#[derive(Clone, Debug, PartialEq)]
pub enum HandlerKind<'g> {
    Catch(TypeId<'g>),
    Finally,
}

/// One row of the exception-region table, offsets all relative to the method start
#[derive(Clone, Debug, PartialEq)]
pub struct ExceptionRegion<'g> {
    pub kind: HandlerKind<'g>,
    pub try_start: Offset,
    pub try_end: Offset,
    pub handler_start: Offset,
    pub handler_end: Offset,
}

/// A finished method body: everything a JIT needs to materialize a callable
#[derive(Clone, Debug, PartialEq)]
pub struct MethodBody<'g> {
    pub bytes: Vec<u8>,
    pub max_stack: usize,
    pub return_type: Option<CilType<'g>>,
    pub locals: Vec<CilType<'g>>,
    pub exception_regions: Vec<ExceptionRegion<'g>>,
}

struct OpenRegion<'g> {
    try_start: Offset,
    try_end: Option<Offset>,
    handler: Option<(HandlerKind<'g>, Offset)>,
    rows: Vec<ExceptionRegion<'g>>,
}

/// In-memory host that assembles bytes into a [`MethodBody`]
#[derive(Default)]
pub struct BytecodeHost<'g> {
    bytes: Vec<u8>,
    regions: Vec<ExceptionRegion<'g>>,
    open: Vec<OpenRegion<'g>>,
}

impl<'g> BytecodeHost<'g> {
    pub fn new() -> BytecodeHost<'g> {
        BytecodeHost {
            bytes: vec![],
            regions: vec![],
            open: vec![],
        }
    }

    /// Close the handler currently being filled in, if any
    fn seal_handler(region: &mut OpenRegion<'g>, at: Offset) {
        if let Some((kind, handler_start)) = region.handler.take() {
            let row = ExceptionRegion {
                kind,
                try_start: region.try_start,
                try_end: region.try_end.unwrap_or(at),
                handler_start,
                handler_end: at,
            };
            region.rows.push(row);
        }
    }

    fn open_handler(&mut self, kind: HandlerKind<'g>) {
        let at = self.current_offset();
        let region = self
            .open
            .last_mut()
            .expect("handler opened outside a protected region");
        Self::seal_handler(region, at);
        if region.try_end.is_none() {
            region.try_end = Some(at);
        }
        region.handler = Some((kind, at));
    }
}

impl<'g> Default for OpenRegion<'g> {
    fn default() -> Self {
        OpenRegion {
            try_start: Offset::START,
            try_end: None,
            handler: None,
            rows: vec![],
        }
    }
}

impl<'g> HostEmitter<'g> for BytecodeHost<'g> {
    type Delegate = MethodBody<'g>;

    fn append_opcode(&mut self, encoding: &[u8]) {
        self.bytes.extend_from_slice(encoding);
    }

    fn append_operand(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn patch(&mut self, offset: Offset, bytes: &[u8]) {
        let end = offset.0 + bytes.len();
        self.bytes[offset.0..end].copy_from_slice(bytes);
    }

    fn current_offset(&self) -> Offset {
        Offset(self.bytes.len())
    }

    fn begin_try(&mut self) {
        self.open.push(OpenRegion {
            try_start: self.current_offset(),
            ..OpenRegion::default()
        });
    }

    fn begin_catch(&mut self, catch_type: TypeId<'g>) {
        self.open_handler(HandlerKind::Catch(catch_type));
    }

    fn begin_finally(&mut self) {
        self.open_handler(HandlerKind::Finally);
    }

    fn end_try(&mut self) {
        let at = self.current_offset();
        let mut region = self
            .open
            .pop()
            .expect("protected region closed but none is open");
        Self::seal_handler(&mut region, at);
        self.regions.extend(region.rows);
    }

    fn finalize(
        &mut self,
        return_type: Option<CilType<'g>>,
        locals: Vec<CilType<'g>>,
        max_stack: usize,
    ) -> MethodBody<'g> {
        MethodBody {
            bytes: std::mem::take(&mut self.bytes),
            max_stack,
            return_type,
            locals,
            exception_regions: std::mem::take(&mut self.regions),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn patching_rewrites_in_place() {
        let mut host: BytecodeHost = BytecodeHost::new();
        host.append_opcode(&[0x38]);
        host.append_operand(&[0, 0, 0, 0]);
        host.append_opcode(&[0x2A]);

        host.patch(Offset(1), &[1, 0, 0, 0]);

        let body = host.finalize(None, vec![], 0);
        assert_eq!(body.bytes, vec![0x38, 1, 0, 0, 0, 0x2A]);
    }

    #[test]
    fn region_offsets_follow_the_protocol() {
        let mut host: BytecodeHost = BytecodeHost::new();
        host.append_opcode(&[0x00]); // before the region
        host.begin_try();
        host.append_opcode(&[0x00, 0x00]); // try body
        host.begin_finally();
        host.append_opcode(&[0xDC]); // handler body
        host.end_try();

        let body = host.finalize(None, vec![], 0);
        let region = &body.exception_regions[0];
        assert_eq!(region.kind, HandlerKind::Finally);
        assert_eq!(region.try_start, Offset(1));
        assert_eq!(region.try_end, Offset(3));
        assert_eq!(region.handler_start, Offset(3));
        assert_eq!(region.handler_end, Offset(4));
    }
}
