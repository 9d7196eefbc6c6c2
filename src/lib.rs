//! Supervise trees of traced Linux processes.
//!
//! A [`Tracer`] launches leader processes, follows every `fork`, `clone`,
//! `exec`, signal, and exit across the resulting trees via `ptrace(2)`, and
//! feeds a causally-ordered [`Process`] model that downstream tools render
//! or analyse.
//!
//! The hard part is not issuing ptrace requests but interpreting the one
//! mixed `wait(2)` stream the kernel hands back: carrying per-tracee state
//! across stop/resume pairs, virtualising syscalls like `wait4()` whose
//! completion depends on other tracees, tolerating a child's first stop
//! arriving before its parent's fork event, and surviving pid reuse under
//! an external orphan reaper. All of that lives in [`tracer`]; the other
//! modules are the kernel adapter, the launcher, and the process-tree
//! model.
//!
//! ```no_run
//! use treetrace::Tracer;
//!
//! # fn main() -> treetrace::Result<()> {
//! let tracer = Tracer::new();
//! let root = tracer.start("true", vec!["true".into()])?;
//!
//! while tracer.step()? {}
//!
//! print!("{root}");
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod error;

pub mod cmd;
pub mod process;
pub mod sys;
pub mod tracer;

pub(crate) mod wait_call;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "x86_64")]
pub mod x86;

#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64 as arch;

#[cfg(target_arch = "x86_64")]
pub(crate) use x86 as arch;

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;

#[doc(inline)]
pub use cmd::Command;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use process::{Event, ExitKind, Process};

#[doc(inline)]
pub use sys::Registers;

#[doc(inline)]
pub use tracer::Tracer;
