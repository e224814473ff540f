//! Reactive state, session model, UI tree diffing and wire protocol for the
//! trellis server-driven UI runtime.

pub mod cell;
pub mod diff;
pub mod patch;
pub mod protocol;
pub mod session;
pub mod tree;

pub use cell::{Cell, CellChange, CellError, CellStore, Origin, Scope};
pub use diff::{diff, diff_with, DiffOptions};
pub use patch::{apply_patch, Patch, PatchError, PatchOp, PatchOpKind, Path, PathSegment};
pub use protocol::{ClientMsg, FrameError, ServerMsg};
pub use session::{
    MemorySessionBackend, Resolution, Session, SessionBackend, SessionError, SessionId,
    SessionManager,
};
pub use tree::{Node, Prop, Props};
