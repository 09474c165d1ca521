//! SIGINT plumbing for the server accept loops.

use std::{
	io::{Error, Result as IoResult},
	mem,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, OnceLock,
	},
};

static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_sigint(_: libc::c_int) {
	// only lock-free work in here
	if let Some(flag) = FLAG.get() {
		flag.store(true, Ordering::SeqCst);
	}
}

/// Arrange for SIGINT to raise `flag`.  The handler is installed without
/// `SA_RESTART`, so a blocking `accept` returns `Interrupted` and its loop
/// gets to observe the flag.  Only the first call installs; later calls
/// are no-ops.
pub fn stop_on_interrupt(flag: Arc<AtomicBool>) -> IoResult<()> {
	if FLAG.set(flag).is_err() {
		return Ok(());
	}
	unsafe {
		let mut sa: libc::sigaction = mem::zeroed();
		sa.sa_sigaction = (on_sigint as extern "C" fn(libc::c_int)) as usize;
		sa.sa_flags = 0;
		libc::sigemptyset(&mut sa.sa_mask);
		if libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut()) != 0 {
			return Err(Error::last_os_error());
		}
	}
	Ok(())
}
