//! Best-effort thread priority raising.
//!
//! The capture pump and the client's touch sender ask for an "urgent
//! display"-class priority. Failure is expected when the process lacks the
//! privilege and must never affect correctness.

use tracing::debug;

/// Nice value requested for latency-sensitive threads.
const URGENT_NICE: i32 = -10;

/// Raise the calling thread's scheduling priority. Best-effort: logs at
/// debug level and continues on failure.
pub fn raise_current_thread_priority() {
    #[cfg(target_os = "linux")]
    {
        // On Linux setpriority(PRIO_PROCESS, 0, …) targets the calling
        // thread, not the whole process.
        let rc = unsafe { nix::libc::setpriority(nix::libc::PRIO_PROCESS, 0, URGENT_NICE) };
        if rc != 0 {
            debug!(
                "setpriority({URGENT_NICE}) failed: {} — continuing at default priority",
                std::io::Error::last_os_error()
            );
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        debug!("thread priority raising not implemented on this platform");
    }
}
