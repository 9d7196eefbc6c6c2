use std::ffi::{CString, NulError, OsString};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};

use nix::sys::ptrace;
use nix::sys::signal::{raise, Signal};
use nix::unistd::{fork, ForkResult};

use crate::error::{Error, Result};
use crate::Pid;

/// Command to spawn as the leader of a traced process tree.
///
/// The program path is resolved against `$PATH` up front, in the parent, so
/// the post-fork child never has to report a lookup failure.
#[derive(Clone, Debug)]
pub struct Command {
    /// Resolved program path, argument 0 of `execve()`.
    program: CString,

    /// Argument vector, including `argv[0]`.
    argv: Vec<CString>,

    /// Environment to pass to the child, as `KEY=value` strings. Inherits
    /// the parent's environment by default.
    env: Vec<CString>,
}

impl Command {
    /// Build a command from a program path and an argument vector that
    /// includes `argv[0]`.
    ///
    /// Fails with [`Error::Runtime`] if `path` cannot be resolved to an
    /// executable file, or if any argument contains an interior NUL.
    pub fn new(path: impl AsRef<str>, argv: Vec<String>) -> Result<Self> {
        let path = path.as_ref();

        let resolved = resolve_program(path)
            .ok_or_else(|| Error::Runtime(format!("no such executable: {path}")))?;

        // Ensure we own NUL-terminated strings for the foreign exec call.
        //
        // We're heap-allocating, so always do this before forking.
        let program = {
            use std::os::unix::ffi::OsStringExt;
            CString::new(resolved.into_os_string().into_vec()).map_err(nul_error)?
        };

        let argv = argv
            .into_iter()
            .map(CString::new)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(nul_error)?;

        let env = inherited_env().map_err(nul_error)?;

        Ok(Self { program, argv, env })
    }

    /// Override the child's environment.
    pub fn set_env<K, V>(&mut self, vars: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut env = Vec::new();

        for (key, val) in vars {
            env.push(env_entry(key.into(), val.into()).map_err(nul_error)?);
        }

        self.env = env;
        Ok(())
    }

    /// Fork and exec the command, returning the child's pid.
    ///
    /// The child sets itself as a tracee of the parent and raises `SIGSTOP`
    /// before the exec, so the parent can set attach options and resume it
    /// without a race.
    pub fn fork_exec(self) -> Result<Pid> {
        // These calls heap-allocate, and must occur pre-fork.
        let argv = NullTerminatedPointerArray::new(&self.argv);
        let env = NullTerminatedPointerArray::new(&self.env);

        match unsafe { fork() }? {
            ForkResult::Child => {
                // If any post-fork call fails, panic: `?` may call `malloc`
                // via `Into`, which is not async-signal-safe.

                if ptrace::traceme().is_err() {
                    panic!("Unable to mark child as traced");
                }

                if raise(Signal::SIGSTOP).is_err() {
                    panic!("Unable to raise SIGSTOP");
                }

                // Use `libc::execve` directly: the `nix` wrapper heap-
                // allocates a `Vec` internally, which is not
                // async-signal-safe.
                unsafe {
                    libc::execve(self.program.as_ptr(), argv.as_ptr(), env.as_ptr());
                }

                panic!("Unable to exec tracee");
            }
            ForkResult::Parent { child } => Ok(child),
        }
    }
}

fn nul_error(_: NulError) -> Error {
    Error::Runtime("command string contains an interior NUL".into())
}

fn env_entry(key: OsString, val: OsString) -> std::result::Result<CString, NulError> {
    use std::os::unix::ffi::OsStrExt;

    let mut kv = OsString::new();
    kv.push(&key);
    kv.push("=");
    kv.push(&val);

    CString::new(kv.as_bytes())
}

fn inherited_env() -> std::result::Result<Vec<CString>, NulError> {
    std::env::vars_os()
        .map(|(key, val)| env_entry(key, val))
        .collect()
}

/// Resolve `path` the way `execvp()` would: paths containing a slash are
/// used as-is, bare names are searched for in `$PATH`.
fn resolve_program(path: &str) -> Option<PathBuf> {
    if path.contains('/') {
        let candidate = PathBuf::from(path);
        return is_executable(&candidate).then_some(candidate);
    }

    let search = std::env::var_os("PATH")?;

    std::env::split_paths(&search)
        .map(|dir| dir.join(path))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

// View of a slice of `CString` values, as a null-terminated array of pointers
// to `c_char`. For passing args to `execve()`.
struct NullTerminatedPointerArray<'a> {
    // Owned pointer array which must always be NULL-terminated.
    array: Vec<*const c_char>,

    // Borrow of pointed-to `CString` data. Pointers in `array` are valid only
    // while we have this borrow.
    _data: &'a [CString],
}

impl<'a> NullTerminatedPointerArray<'a> {
    fn new(data: &'a [CString]) -> Self {
        let mut array: Vec<_> = data.iter().map(|s| s.as_ptr()).collect();
        array.push(std::ptr::null());

        Self { array, _data: data }
    }

    fn as_ptr(&self) -> *const *const c_char {
        self.array.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_absolute_and_path_relative_programs() {
        assert!(resolve_program("/bin/true").is_some());
        assert!(resolve_program("true").is_some());
        assert!(resolve_program("definitely-not-a-real-program-xyz").is_none());
    }

    #[test]
    fn rejects_interior_nul() {
        let err = Command::new("true", vec!["tr\0ue".into()]).unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[test]
    fn missing_program_is_a_runtime_error() {
        let err = Command::new("definitely-not-a-real-program-xyz", vec!["x".into()]);
        assert!(matches!(err.unwrap_err(), Error::Runtime(_)));
    }
}
