use crate::objects::object::{Object, ObjectKind};
use crate::value::Value;

/// A captured variable. While the owning frame is live the upvalue is open
/// and addresses the shared value stack by slot index; when the local goes
/// out of scope it closes over a copy. The transition happens exactly once.
///
/// Indexing by slot (rather than holding a pointer into the stack) keeps
/// stack reallocation in `ensure_stack` safe.
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[repr(C)]
pub struct ObjectUpvalue {
    pub object: Object,
    pub state: UpvalueState,
}

impl ObjectUpvalue {
    pub fn new(slot: usize) -> Box<ObjectUpvalue> {
        Box::new(ObjectUpvalue {
            object: Object::new(ObjectKind::Upvalue),
            state: UpvalueState::Open(slot),
        })
    }

    pub fn open_slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }

    pub fn close(&mut self, value: Value) {
        debug_assert!(matches!(self.state, UpvalueState::Open(_)));
        self.state = UpvalueState::Closed(value);
    }
}
