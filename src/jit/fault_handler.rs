//! Process-wide SIGSEGV/SIGBUS handler that routes fastmem faults to the
//! JIT running on the faulting thread.
//!
//! The JIT registers itself for the duration of [`super::compiler::Jit::run`]
//! through [`ActiveJit`]. Faults on threads without an active JIT, or that
//! the JIT does not recognise, fall back to the default action.

use std::cell::Cell;
use std::io;
use std::sync::OnceLock;

use super::compiler::{Jit, JitError};

thread_local! {
    static CURRENT_JIT: Cell<*mut Jit> = const { Cell::new(std::ptr::null_mut()) };
}

/// Marks a JIT as running on this thread until dropped.
pub struct ActiveJit {
    previous: *mut Jit,
}

impl ActiveJit {
    pub fn enter(jit: *mut Jit) -> Self {
        let previous = CURRENT_JIT.with(|current| current.replace(jit));
        Self { previous }
    }
}

impl Drop for ActiveJit {
    fn drop(&mut self) {
        CURRENT_JIT.with(|current| current.set(self.previous));
    }
}

/// Install the handler once per process. Later calls return the outcome of
/// the first.
pub fn install_fault_handler() -> Result<(), JitError> {
    static RESULT: OnceLock<Option<i32>> = OnceLock::new();

    let errno = RESULT.get_or_init(|| platform::install().err().map(|e| e.raw_os_error().unwrap_or(libc::EINVAL)));
    match *errno {
        None => Ok(()),
        Some(errno) => Err(JitError::SignalHandler(io::Error::from_raw_os_error(errno))),
    }
}

/// Hand a fault to the JIT active on this thread. Returns the host address
/// to resume at.
fn dispatch_fault(access_addr: usize, pc: usize) -> Option<usize> {
    let jit = CURRENT_JIT.with(Cell::get);
    if jit.is_null() {
        return None;
    }
    unsafe { (*jit).handle_fault(access_addr, pc) }
}

#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))]
mod platform {
    use std::io;
    use std::mem;

    use super::dispatch_fault;

    pub(super) fn install() -> io::Result<()> {
        for signal in [libc::SIGSEGV, libc::SIGBUS] {
            unsafe {
                let mut action: libc::sigaction = mem::zeroed();
                action.sa_sigaction = handle_signal as usize;
                action.sa_flags = libc::SA_SIGINFO;
                libc::sigemptyset(&mut action.sa_mask);
                if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }

    extern "C" fn handle_signal(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
        let uc = context as *mut libc::ucontext_t;
        unsafe {
            let access = fault_address(info);
            let pc = program_counter(uc);
            match dispatch_fault(access, pc) {
                Some(resume) => set_program_counter(uc, resume),
                // Re-raise on return with the default action.
                None => {
                    libc::signal(signal, libc::SIG_DFL);
                }
            }
        }
    }

    #[cfg(target_os = "linux")]
    unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
        unsafe { (*info).si_addr() as usize }
    }

    #[cfg(target_os = "linux")]
    unsafe fn program_counter(uc: *mut libc::ucontext_t) -> usize {
        unsafe { (*uc).uc_mcontext.pc as usize }
    }

    #[cfg(target_os = "linux")]
    unsafe fn set_program_counter(uc: *mut libc::ucontext_t, pc: usize) {
        unsafe { (*uc).uc_mcontext.pc = pc as u64 };
    }

    #[cfg(target_os = "macos")]
    unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
        unsafe { (*info).si_addr as usize }
    }

    #[cfg(target_os = "macos")]
    unsafe fn program_counter(uc: *mut libc::ucontext_t) -> usize {
        unsafe { (*(*uc).uc_mcontext).__ss.__pc as usize }
    }

    #[cfg(target_os = "macos")]
    unsafe fn set_program_counter(uc: *mut libc::ucontext_t, pc: usize) {
        unsafe { (*(*uc).uc_mcontext).__ss.__pc = pc as u64 };
    }
}

#[cfg(not(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))))]
mod platform {
    use std::io;

    // Generated code never runs here, so there is nothing to catch.
    pub(super) fn install() -> io::Result<()> {
        let _ = super::dispatch_fault;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_jit_nests() {
        let outer = 0x10 as *mut Jit;
        let inner = 0x20 as *mut Jit;
        {
            let _a = ActiveJit::enter(outer);
            {
                let _b = ActiveJit::enter(inner);
                assert_eq!(CURRENT_JIT.with(Cell::get), inner);
            }
            assert_eq!(CURRENT_JIT.with(Cell::get), outer);
        }
        assert!(CURRENT_JIT.with(Cell::get).is_null());
    }

    #[test]
    fn test_no_active_jit_declines_fault() {
        assert_eq!(dispatch_fault(0x1000, 0x2000), None);
    }

    #[test]
    fn test_install_is_idempotent() {
        assert!(install_fault_handler().is_ok());
        assert!(install_fault_handler().is_ok());
    }
}
