//! jascos - a simulated multiprocess kernel
//!
//! Processes run in isolated execution contexts and share nothing. They talk
//! to the kernel by message passing only: numbered action requests go in,
//! responses and interrupts come out. The kernel owns every process's fd
//! table, connects processes with pipes, and serves executables from a
//! read-only tree filesystem.
//!
//! Layout:
//! - `kernel`: process table, pipes, the wire protocol and the syscall dispatcher
//! - `vfs`: the snapshot-backed filesystem executables are loaded from
//! - `runtime`: the thread-per-process host and the context-side client
//! - `platform`: display and keyboard

pub mod kernel;
pub mod platform;
pub mod runtime;
pub mod vfs;

pub use kernel::{Halt, Kernel, KernelConfig};
