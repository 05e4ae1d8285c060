//! The message-call tree of one transaction, arena-allocated.
//!
//! Calls reference their parent and children by id; the `data` slot carries
//! per-tracer state (summaries, taint trackers, block paths) opaquely.

use revm::primitives::{Address, Bytes, U256};

use crate::engine::{ExecResult, Receipt, VmError};
use crate::tracing::location::{TraceBlock, TraceLocation};
use crate::tracing::position::CallPosition;

pub type CallId = usize;

#[derive(Debug, Clone)]
pub struct CallerInfo {
    /// None when the caller is the EOA initiating the transaction.
    pub code_addr: Option<Address>,
    pub state_addr: Address,
    /// The call-site program point; None for the root call.
    pub call_site: Option<TraceLocation>,
}

#[derive(Debug)]
pub struct MsgCall<D> {
    pub id: CallId,
    pub parent: Option<CallId>,
    pub children: Vec<CallId>,

    pub position: CallPosition,
    /// Opcode that entered this call; CALL or CREATE for the root.
    pub op: u8,
    pub caller: CallerInfo,
    pub precompiled: bool,
    pub code_addr: Address,
    pub state_addr: Address,
    pub input: Bytes,
    pub value: U256,

    pub result: Option<ExecResult>,
    pub receipt: Option<Receipt>,

    /// Only valid while this call is executing.
    pub current_location: Option<TraceLocation>,

    // Block-path recording (only populated by the trace-block variant).
    pub(crate) last_location: Option<TraceLocation>,
    pub(crate) open_block: Option<TraceBlock>,
    /// Alternating decomposition: segment i holds the caller's blocks
    /// executed between child i-1 and child i.
    pub block_paths: Vec<Vec<TraceBlock>>,

    pub data: D,
}

impl<D> MsgCall<D> {
    pub fn is_root(&self) -> bool {
        self.caller.code_addr.is_none()
    }

    pub fn failed(&self) -> bool {
        self.result.as_ref().map_or(false, |r| r.failed())
    }

    pub fn error(&self) -> Option<&VmError> {
        self.result.as_ref().and_then(|r| r.error.as_ref())
    }
}

#[derive(Debug, Default)]
pub struct CallArena<D> {
    pub calls: Vec<MsgCall<D>>,
}

impl<D> CallArena<D> {
    pub fn new() -> Self {
        Self { calls: Vec::new() }
    }

    pub fn get(&self, id: CallId) -> &MsgCall<D> {
        &self.calls[id]
    }

    pub fn get_mut(&mut self, id: CallId) -> &mut MsgCall<D> {
        &mut self.calls[id]
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push_call(
        &mut self,
        parent: Option<CallId>,
        position: CallPosition,
        op: u8,
        caller: CallerInfo,
        precompiled: bool,
        code_addr: Address,
        state_addr: Address,
        input: Bytes,
        value: U256,
        data: D,
    ) -> CallId {
        let id = self.calls.len();
        self.calls.push(MsgCall {
            id,
            parent,
            children: Vec::new(),
            position,
            op,
            caller,
            precompiled,
            code_addr,
            state_addr,
            input,
            value,
            result: None,
            receipt: None,
            current_location: None,
            last_location: None,
            open_block: None,
            block_paths: vec![Vec::new()],
            data,
        });
        if let Some(p) = parent {
            self.calls[p].children.push(id);
        }
        id
    }

    /// Child position for the next call the parent is about to make.
    pub fn gen_child_position(&self, parent: CallId, precompiled: bool) -> CallPosition {
        let p = &self.calls[parent];
        let compact_index = p
            .children
            .iter()
            .filter(|c| !self.calls[**c].precompiled)
            .count();
        p.position.child(p.children.len(), compact_index, precompiled)
    }

    /// Pre-order walk over the subtree rooted at `id`.
    pub fn walk(&self, id: CallId, f: &mut impl FnMut(&MsgCall<D>) -> bool) -> bool {
        if f(self.get(id)) {
            return true;
        }
        for child in self.get(id).children.clone() {
            if self.walk(child, f) {
                return true;
            }
        }
        false
    }

    pub fn find_by_position(&self, root: CallId, pos: &CallPosition) -> Option<CallId> {
        let mut found = None;
        self.walk(root, &mut |call| {
            if call.position == *pos {
                found = Some(call.id);
                true
            } else {
                false
            }
        });
        found
    }

    /// Whether any call in the subtree ran out of gas.
    pub fn out_of_gas(&self, id: CallId) -> bool {
        let mut hit = false;
        self.walk(id, &mut |call| {
            if matches!(call.error(), Some(VmError::OutOfGas)) {
                hit = true;
                true
            } else {
                false
            }
        });
        hit
    }
}
