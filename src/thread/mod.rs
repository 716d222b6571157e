mod debug;
mod error;
mod executor;
mod thread;
mod vm;

pub use self::{
    debug::{FrameInfo, Hook, HookMask},
    error::{BadThreadMode, VMError, VariableName},
    executor::{
        BadExecutorMode, CurrentThread, Execution, Executor, ExecutorInner, ExecutorMode,
    },
    thread::{Thread, ThreadInner, ThreadMode},
};

pub(crate) use self::{
    debug::{backtrace, frame_at_level, frame_info, frame_local, location, native_frame},
    thread::{Frame, ThreadState},
};
